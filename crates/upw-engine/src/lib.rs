// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! upw-engine
//!
//! The pipeline executor: given a monitor snapshot, construct its stages
//! from the registry, run them strictly in order against one shared
//! [`CheckContext`], and merge the per-stage verdicts into a single
//! [`CheckResult`].
//!
//! Stage failures are data, not errors: anything a stage returns as `Err`
//! is caught here and converted into a stage-level `down`, which then
//! short-circuits the remaining stages.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};
use upw_core::{
    CheckContext, CheckResult, CheckStatus, EngineError, Monitor, StageSpec, MAX_MESSAGE_LEN,
};
use upw_stages::{Stage, StageRegistry, DEFAULT_STAGE_TIMEOUT_SECS};
use upw_store::{MonitorStore, StoreError};

/// Slack multiplier applied to the sum of stage timeouts to bound a whole
/// pipeline run.
const PIPELINE_SLACK: f64 = 1.1;

/// Outcome of one executed stage, as recorded into the aggregate result.
#[derive(Clone, Debug)]
struct StageRecord {
    stage_type: String,
    status: CheckStatus,
    message: String,
    elapsed_ms: f64,
    details: serde_json::Map<String, serde_json::Value>,
}

/// The pipeline evaluation engine.
///
/// One instance is shared between the REST surface and the scheduler; both
/// paths run the same executor against the same frozen registry and store.
pub struct Engine {
    registry: Arc<StageRegistry>,
    store: Arc<dyn MonitorStore>,
}

impl Engine {
    /// Build an engine over a frozen registry and a storage handle.
    pub fn new(registry: Arc<StageRegistry>, store: Arc<dyn MonitorStore>) -> Self {
        Self { registry, store }
    }

    /// The stage registry this engine resolves stage types against.
    #[must_use]
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// Configuration-time pipeline validation: every stage type must
    /// resolve, every constructor must accept its options, and at least one
    /// stage must be a network stage.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownStage`], [`EngineError::StageConfig`], or
    /// [`EngineError::BadPipeline`].
    pub fn validate_pipeline(&self, pipeline: &[StageSpec]) -> Result<(), EngineError> {
        if pipeline.is_empty() {
            return Err(EngineError::BadPipeline {
                reason: "pipeline must contain at least one stage".into(),
            });
        }
        let mut has_network = false;
        for (index, spec) in pipeline.iter().enumerate() {
            let stage = self.registry.build(spec).map_err(|e| match e {
                EngineError::StageConfig { stage_type, reason } => EngineError::StageConfig {
                    stage_type,
                    reason: format!("stage {index}: {reason}"),
                },
                other => other,
            })?;
            has_network |= stage.meta().network;
        }
        if !has_network {
            return Err(EngineError::BadPipeline {
                reason: "pipeline must contain at least one network stage".into(),
            });
        }
        Ok(())
    }

    /// Execute a monitor's pipeline and return the (not yet persisted)
    /// result.
    pub async fn execute(&self, monitor: &Monitor, verbose: bool) -> CheckResult {
        let checked_at = Utc::now();
        let clock = Instant::now();
        let mut ctx = CheckContext::new();

        // Structural pre-flight: a pipeline with no network stage cannot
        // seed the context and fails as a whole.
        let network_possible = monitor
            .pipeline
            .iter()
            .any(|spec| self.registry.meta(&spec.stage_type).is_some_and(|m| m.network));
        if monitor.pipeline.is_empty() || !network_possible {
            return CheckResult {
                id: CheckResult::new_id(),
                monitor_id: monitor.id.clone(),
                checked_at,
                status: CheckStatus::Down,
                message: "pipeline_invalid".into(),
                elapsed_ms: clock.elapsed().as_secs_f64() * 1000.0,
                details: serde_json::Map::new(),
            };
        }

        // Construct every stage up front so the whole-pipeline cap can be
        // derived before the first check runs.
        let built: Vec<Result<Box<dyn Stage>, EngineError>> = monitor
            .pipeline
            .iter()
            .map(|spec| self.registry.build(spec))
            .collect();
        let budget: Duration = built
            .iter()
            .map(|b| match b {
                Ok(stage) => stage.hard_timeout(),
                Err(_) => Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
            })
            .sum();
        let deadline = clock + budget.mul_f64(PIPELINE_SLACK);

        let mut records: Vec<StageRecord> = Vec::with_capacity(built.len());
        let mut pipeline_timed_out = false;

        for (spec, built) in monitor.pipeline.iter().zip(built) {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                pipeline_timed_out = true;
                break;
            };

            let stage_clock = Instant::now();
            let record = match built {
                Err(e) => StageRecord {
                    stage_type: spec.stage_type.clone(),
                    status: CheckStatus::Down,
                    message: e.kind(),
                    elapsed_ms: 0.0,
                    details: error_details(&e.kind()),
                },
                Ok(stage) => {
                    let hard = stage.hard_timeout();
                    let bounded = hard.min(remaining);
                    match timeout(bounded, stage.check(&monitor.url, verbose, &mut ctx)).await {
                        Ok(Ok(report)) => StageRecord {
                            stage_type: spec.stage_type.clone(),
                            status: report.status,
                            message: report.message,
                            elapsed_ms: stage_clock.elapsed().as_secs_f64() * 1000.0,
                            details: report.details,
                        },
                        Ok(Err(e)) => {
                            let kind = e.kind();
                            StageRecord {
                                stage_type: spec.stage_type.clone(),
                                status: CheckStatus::Down,
                                message: kind.clone(),
                                elapsed_ms: stage_clock.elapsed().as_secs_f64() * 1000.0,
                                details: error_details(&kind),
                            }
                        }
                        Err(_) => {
                            if bounded < hard {
                                // The pipeline budget, not the stage's own
                                // timeout, cut this stage short.
                                pipeline_timed_out = true;
                                break;
                            }
                            StageRecord {
                                stage_type: spec.stage_type.clone(),
                                status: CheckStatus::Down,
                                message: "timeout".into(),
                                elapsed_ms: stage_clock.elapsed().as_secs_f64() * 1000.0,
                                details: error_details("timeout"),
                            }
                        }
                    }
                }
            };

            debug!(
                target: "upw.engine",
                monitor_id = %monitor.id,
                stage = %record.stage_type,
                status = %record.status,
                elapsed_ms = record.elapsed_ms,
                "stage finished"
            );

            let halt = record.status == CheckStatus::Down;
            records.push(record);
            if halt {
                break;
            }
        }

        let elapsed_ms = clock.elapsed().as_secs_f64() * 1000.0;
        let (status, message) = if pipeline_timed_out {
            (CheckStatus::Down, "pipeline_timeout".to_string())
        } else {
            aggregate(&records)
        };

        CheckResult {
            id: CheckResult::new_id(),
            monitor_id: monitor.id.clone(),
            checked_at,
            status,
            message,
            elapsed_ms,
            details: keyed_details(records),
        }
    }

    /// Execute a monitor's pipeline, persist the result, and refresh the
    /// monitor mirror.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the result cannot be appended; mirror failures
    /// are logged and tolerated (the mirror is re-derivable).
    pub async fn run_and_record(
        &self,
        monitor: &Monitor,
        verbose: bool,
    ) -> Result<CheckResult, StoreError> {
        let result = self.execute(monitor, verbose).await;
        self.record(monitor, result).await
    }

    /// Persist an already-produced result and refresh the mirror.
    pub async fn record(
        &self,
        monitor: &Monitor,
        result: CheckResult,
    ) -> Result<CheckResult, StoreError> {
        self.store.append_result(&result).await?;
        if let Err(e) = self
            .store
            .update_monitor_mirror(&monitor.id, result.checked_at, result.status)
            .await
        {
            warn!(
                target: "upw.engine",
                monitor_id = %monitor.id,
                error = %e,
                "monitor mirror update failed"
            );
        }
        Ok(result)
    }
}

fn error_details(kind: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut details = serde_json::Map::new();
    details.insert("error".into(), serde_json::Value::String(kind.to_string()));
    details
}

/// Worst-of status plus the `; `-joined, length-capped message.
fn aggregate(records: &[StageRecord]) -> (CheckStatus, String) {
    let status = CheckStatus::worst_of(records.iter().map(|r| r.status));
    let mut message = records
        .iter()
        .map(|r| format!("{}: {}", r.stage_type, r.message))
        .collect::<Vec<_>>()
        .join("; ");
    if message.chars().count() > MAX_MESSAGE_LEN {
        message = message.chars().take(MAX_MESSAGE_LEN).collect();
    }
    (status, message)
}

/// Key per-stage details by stage type, suffixing repeats (`http`,
/// `http#1`, ...) so executed stages always leave a detail entry.
fn keyed_details(records: Vec<StageRecord>) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::new();
    let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for record in records {
        let n = seen.entry(record.stage_type.clone()).or_insert(0);
        let key = if *n == 0 {
            record.stage_type.clone()
        } else {
            format!("{}#{n}", record.stage_type)
        };
        *n += 1;
        out.insert(key, serde_json::Value::Object(record.details));
    }
    out
}
