// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! upw-core
//!
//! The stable contract for the upwatch monitoring engine: monitors, stage
//! specs, check results, and the per-run context shared between stages.
//!
//! If you only take one dependency, take this one.

/// Per-run scratch space and `$name` value references.
pub mod context;
/// Error taxonomy shared by the engine, stages, and scheduler.
pub mod error;

pub use context::CheckContext;
pub use error::EngineError;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum accepted monitor URL length, in characters.
pub const MAX_URL_LEN: usize = 2048;

/// Minimum accepted fixed check interval, in seconds.
pub const MIN_INTERVAL_SECS: u64 = 10;

/// Default fixed check interval when a monitor specifies none.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Maximum length of an aggregated result message.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Default per-monitor result retention when none is configured.
pub const DEFAULT_RESULTS_RETENTION: u32 = 100;

/// Hard cap on `list_results` page size.
pub const MAX_RESULTS_LIMIT: u32 = 10_000;

// ---------------------------------------------------------------------------
// CheckStatus
// ---------------------------------------------------------------------------

/// Outcome of a stage or of a whole pipeline run.
///
/// The variants form a total order (`Up < Degraded < Down`) so aggregate
/// verdicts are a `max` over stage verdicts.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// The target behaved as expected.
    Up,
    /// The target responded but outside acceptable bounds.
    Degraded,
    /// The target failed the check.
    Down,
}

impl CheckStatus {
    /// Merge two statuses under the worst-of rule.
    #[must_use]
    pub fn worst(self, other: CheckStatus) -> CheckStatus {
        self.max(other)
    }

    /// Fold an iterator of statuses into the aggregate verdict.
    ///
    /// An empty iterator aggregates to [`CheckStatus::Up`]; the executor
    /// never produces one because pipelines are non-empty.
    pub fn worst_of(statuses: impl IntoIterator<Item = CheckStatus>) -> CheckStatus {
        statuses
            .into_iter()
            .fold(CheckStatus::Up, CheckStatus::worst)
    }

    /// Stable lowercase form used on the wire and in storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "degraded" => Ok(Self::Degraded),
            "down" => Ok(Self::Down),
            other => Err(EngineError::Internal(format!(
                "unrecognized status `{other}`"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// StageSpec
// ---------------------------------------------------------------------------

/// One step of a monitor's pipeline: a registered stage type plus its
/// stage-specific options.
///
/// Options are an open map validated lazily by the stage constructor, so new
/// stage types can ship without touching the monitor model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageSpec {
    /// Registered stage type name (e.g. `"http"`, `"threshold"`).
    #[serde(rename = "type")]
    pub stage_type: String,

    /// Stage-specific options; unknown keys are tolerated.
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl StageSpec {
    /// Build a spec with no options.
    pub fn new(stage_type: impl Into<String>) -> Self {
        Self {
            stage_type: stage_type.into(),
            options: serde_json::Map::new(),
        }
    }

    /// Attach an option (builder pattern, handy in tests).
    #[must_use]
    pub fn option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Caller-supplied monitor fields, used for both create and update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MonitorSpec {
    /// Display name, 1–100 printable characters.
    pub name: String,

    /// Target URL; scheme defaults to `https` when missing.
    pub url: String,

    /// Ordered, non-empty stage pipeline.
    pub pipeline: Vec<StageSpec>,

    /// Fixed check cadence in seconds (ignored when `schedule` is set).
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Optional 5-field cron expression; wins over `interval` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Disabled monitors are retained but never scheduled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Free-form labels; deduplicated, insertion order preserved.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_enabled() -> bool {
    true
}

/// Durable monitor configuration: a target URL bound to a stage pipeline
/// plus its scheduling cadence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Monitor {
    /// Opaque stable identifier; immutable after creation.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Target URL (scheme always present after normalization).
    pub url: String,

    /// Ordered, non-empty stage pipeline.
    pub pipeline: Vec<StageSpec>,

    /// Fixed check cadence in seconds.
    pub interval: u64,

    /// Optional cron expression; effective cadence when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Whether the scheduler materializes a job for this monitor.
    pub enabled: bool,

    /// Deduplicated labels.
    pub tags: Vec<String>,

    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp (UTC).
    pub updated_at: DateTime<Utc>,

    /// Denormalized mirror of the newest result; may lag briefly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,

    /// Denormalized mirror of the newest result status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<CheckStatus>,
}

impl Monitor {
    /// Materialize a monitor from a validated spec, minting a fresh id.
    pub fn from_spec(spec: MonitorSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            url: spec.url,
            pipeline: spec.pipeline,
            interval: spec.interval,
            schedule: spec.schedule,
            enabled: spec.enabled,
            tags: spec.tags,
            created_at: now,
            updated_at: now,
            last_check: None,
            last_status: None,
        }
    }

    /// Apply an update spec in place, preserving identity and creation time.
    pub fn apply_spec(&mut self, spec: MonitorSpec, now: DateTime<Utc>) {
        self.name = spec.name;
        self.url = spec.url;
        self.pipeline = spec.pipeline;
        self.interval = spec.interval;
        self.schedule = spec.schedule;
        self.enabled = spec.enabled;
        self.tags = spec.tags;
        self.updated_at = now;
    }

    /// True when `other` differs in a way the scheduler cares about.
    ///
    /// Cosmetic edits (name, tags) do not force a job re-registration.
    #[must_use]
    pub fn schedule_relevant_change(&self, other: &Monitor) -> bool {
        self.interval != other.interval
            || self.schedule != other.schedule
            || self.enabled != other.enabled
            || self.url != other.url
            || self.pipeline != other.pipeline
    }
}

/// Validate and normalize caller-supplied monitor fields.
///
/// Checks everything the contract can check without the stage registry:
/// name shape, URL length and scheme, pipeline non-emptiness, interval
/// floor, and tag deduplication. Registry resolution and cron syntax are
/// the caller's concern.
///
/// # Errors
///
/// Returns [`EngineError::Validation`] naming the offending field.
pub fn normalize_spec(spec: &mut MonitorSpec) -> Result<(), EngineError> {
    let name = spec.name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(EngineError::Validation(
            "name must be 1-100 characters".into(),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(EngineError::Validation(
            "name must contain only printable characters".into(),
        ));
    }
    spec.name = name.to_string();

    if !spec.url.contains("://") {
        spec.url = format!("https://{}", spec.url);
    }
    if spec.url.chars().count() > MAX_URL_LEN {
        return Err(EngineError::Validation(format!(
            "url exceeds {MAX_URL_LEN} characters"
        )));
    }

    if spec.pipeline.is_empty() {
        return Err(EngineError::BadPipeline {
            reason: "pipeline must contain at least one stage".into(),
        });
    }

    if spec.schedule.is_none() && spec.interval < MIN_INTERVAL_SECS {
        return Err(EngineError::Validation(format!(
            "interval must be at least {MIN_INTERVAL_SECS} seconds"
        )));
    }

    let mut seen = std::collections::HashSet::new();
    spec.tags.retain(|t| seen.insert(t.clone()));

    Ok(())
}

// ---------------------------------------------------------------------------
// CheckResult
// ---------------------------------------------------------------------------

/// Durable outcome of one pipeline execution.
///
/// Append-only: a result is never mutated after insertion, and the store
/// keeps at most the configured retention per monitor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CheckResult {
    /// Unique result identifier.
    pub id: String,

    /// Monitor this result belongs to.
    pub monitor_id: String,

    /// When the pipeline run started (UTC).
    pub checked_at: DateTime<Utc>,

    /// Aggregate verdict (worst-of over executed stages).
    pub status: CheckStatus,

    /// `; `-joined stage messages in pipeline order, capped at
    /// [`MAX_MESSAGE_LEN`] characters.
    pub message: String,

    /// Wall-clock of the whole pipeline, in milliseconds.
    pub elapsed_ms: f64,

    /// Per-stage detail objects keyed by stage type (suffixed `#i` when a
    /// type occurs more than once).
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl CheckResult {
    /// Mint a result id.
    #[must_use]
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}
