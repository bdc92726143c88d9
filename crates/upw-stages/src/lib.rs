// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! upw-stages
//!
//! The polymorphic stage contract every network probe, extractor, and
//! assertion implements, the process-wide registry mapping stage-type names
//! to constructors, and the built-in stage library.
//!
//! Stages are built per pipeline run from a [`StageSpec`]; the registry is
//! populated once at startup, frozen behind an `Arc`, and read without
//! locks thereafter.

/// Assertion stages: `threshold`, `contains`, `age`, `json-schema`.
pub mod assert;
/// Extractor stages: `jq`, `jsonpath`, `regex`, `header`.
pub mod extract;
/// HTTP probe stage.
pub mod http;
/// TCP and DNS probe stages.
pub mod net;
mod options;
/// TLS certificate probe stage.
pub mod tls;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;
use upw_core::{CheckContext, CheckStatus, EngineError, StageSpec};

/// Default hard timeout applied to any stage that does not declare one.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a network stage's self-declared timeout.
pub const MAX_STAGE_TIMEOUT_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Stage contract
// ---------------------------------------------------------------------------

/// What a stage hands back to the executor.
///
/// Timing is added by the executor, which wraps every `check` call with a
/// wall clock; stages only report verdict, message, and details.
#[derive(Clone, Debug)]
pub struct StageReport {
    /// Verdict for this stage alone.
    pub status: CheckStatus,
    /// Short human string (the executor prefixes the stage type).
    pub message: String,
    /// Stage-specific diagnostic object.
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl StageReport {
    /// A passing report.
    pub fn up(message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Up, message)
    }

    /// A degraded report.
    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Degraded, message)
    }

    /// A failing report; the executor short-circuits after it.
    pub fn down(message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Down, message)
    }

    fn new(status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    /// Attach a detail entry (builder pattern).
    #[must_use]
    pub fn detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// A single pipeline stage: a network probe, an extractor, or an assertion.
///
/// `check` receives the monitor URL, the verbosity flag, and the live run
/// context. Network stages may replace `response_body`/headers and the
/// built-in `$` values; every stage may add named values; no stage removes
/// keys set by its predecessors.
///
/// Returning `Err` is reserved for unexpected failures (unresolved
/// references, internal errors): the executor converts those to a
/// stage-level `down` carrying the error kind. Ordinary probe failures are
/// `Ok` reports with [`CheckStatus::Down`].
#[async_trait]
pub trait Stage: Send + Sync {
    /// Static metadata for this stage type.
    fn meta(&self) -> &'static StageMeta;

    /// Hard wall-clock bound the executor enforces around `check`.
    ///
    /// Network stages override this with their own `timeout` option, capped
    /// at [`MAX_STAGE_TIMEOUT_SECS`].
    fn hard_timeout(&self) -> Duration {
        Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS)
    }

    /// Run the stage against `url` with the shared run context.
    async fn check(
        &self,
        url: &str,
        verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError>;
}

// ---------------------------------------------------------------------------
// Stage metadata
// ---------------------------------------------------------------------------

/// Class-level stage metadata, surfaced verbatim by `GET /api/stages`.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StageMeta {
    /// Registered type name (`spec.type`).
    #[serde(rename = "type")]
    pub stage_type: &'static str,
    /// Human-readable display name.
    #[serde(rename = "name")]
    pub label: &'static str,
    /// One-line description.
    pub description: &'static str,
    /// Whether this stage issues the primary network request that seeds
    /// the context body and headers.
    #[serde(rename = "is_network_stage")]
    pub network: bool,
    /// Declared options, in display order.
    pub options: &'static [OptionMeta],
}

/// Metadata for a single stage option.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct OptionMeta {
    /// Option key as it appears in the stage spec.
    pub name: &'static str,
    /// Display label.
    pub label: &'static str,
    /// Value type (`string`, `number`, `boolean`, `object`).
    #[serde(rename = "type")]
    pub value_type: &'static str,
    /// Whether the constructor rejects specs missing this option.
    pub required: bool,
    /// Default rendered as a string, when one exists.
    pub default: Option<&'static str>,
    /// One-line description.
    pub description: &'static str,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Constructor signature every stage type registers.
pub type StageBuilder = fn(&StageSpec) -> Result<Box<dyn Stage>, EngineError>;

/// Process-wide map from stage-type name to constructor.
///
/// Populate at startup (usually via [`StageRegistry::with_builtin_stages`]),
/// freeze behind an `Arc`, then read-only on the hot path.
#[derive(Default)]
pub struct StageRegistry {
    entries: HashMap<&'static str, (&'static StageMeta, StageBuilder)>,
}

impl StageRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with every built-in stage.
    #[must_use]
    pub fn with_builtin_stages() -> Self {
        let mut reg = Self::new();
        reg.register(&http::META, http::build);
        reg.register(&tls::META, tls::build);
        reg.register(&net::TCP_META, net::build_tcp);
        reg.register(&net::DNS_META, net::build_dns);
        reg.register(&extract::JQ_META, extract::build_jq);
        reg.register(&extract::JSONPATH_META, extract::build_jsonpath);
        reg.register(&extract::REGEX_META, extract::build_regex);
        reg.register(&extract::HEADER_META, extract::build_header);
        reg.register(&assert::THRESHOLD_META, assert::build_threshold);
        reg.register(&assert::CONTAINS_META, assert::build_contains);
        reg.register(&assert::AGE_META, assert::build_age);
        reg.register(&assert::JSON_SCHEMA_META, assert::build_json_schema);
        reg
    }

    /// Register a stage type, replacing any previous entry with that name.
    pub fn register(&mut self, meta: &'static StageMeta, build: StageBuilder) {
        self.entries.insert(meta.stage_type, (meta, build));
    }

    /// Check whether a stage type is registered.
    #[must_use]
    pub fn contains(&self, stage_type: &str) -> bool {
        self.entries.contains_key(stage_type)
    }

    /// Metadata lookup by stage type.
    #[must_use]
    pub fn meta(&self, stage_type: &str) -> Option<&'static StageMeta> {
        self.entries.get(stage_type).map(|(meta, _)| *meta)
    }

    /// All registered stage metadata, sorted by type name.
    #[must_use]
    pub fn metas(&self) -> Vec<&'static StageMeta> {
        let mut out: Vec<_> = self.entries.values().map(|(meta, _)| *meta).collect();
        out.sort_by_key(|m| m.stage_type);
        out
    }

    /// Construct a stage from a spec.
    ///
    /// Unknown option keys are tolerated for forward compatibility but
    /// logged; validation failures inside the constructor surface as
    /// [`EngineError::StageConfig`].
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownStage`] when `spec.type` is not registered.
    pub fn build(&self, spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
        let (meta, build) =
            self.entries
                .get(spec.stage_type.as_str())
                .ok_or_else(|| EngineError::UnknownStage {
                    stage_type: spec.stage_type.clone(),
                })?;

        for key in spec.options.keys() {
            if !meta.options.iter().any(|o| o.name == key) {
                warn!(
                    target: "upw.stage",
                    stage = meta.stage_type,
                    option = %key,
                    "ignoring unknown stage option"
                );
            }
        }

        build(spec)
    }
}
