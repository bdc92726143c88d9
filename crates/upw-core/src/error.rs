// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error taxonomy shared by the engine, stages, and scheduler.
//!
//! Above the stage boundary, stage failures are *data* (`down` statuses),
//! not errors: the executor catches every [`EngineError`] a stage returns
//! and converts it to a stage-level `down` with the error's short
//! [`kind`](EngineError::kind). Only configuration-time errors reach the
//! HTTP boundary as 4xx.

use thiserror::Error;

/// Everything that can go wrong between monitor ingestion and a persisted
/// check result, storage excluded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The spec's `type` does not resolve in the stage registry.
    #[error("unknown stage type `{stage_type}`")]
    UnknownStage {
        /// The unresolved type name.
        stage_type: String,
    },

    /// Stage constructor rejected its options.
    #[error("invalid `{stage_type}` stage config: {reason}")]
    StageConfig {
        /// Stage type whose options failed validation.
        stage_type: String,
        /// Human-readable validation failure.
        reason: String,
    },

    /// The pipeline is structurally unusable (empty, or no network stage).
    #[error("invalid pipeline: {reason}")]
    BadPipeline {
        /// Why the pipeline was rejected.
        reason: String,
    },

    /// A single stage exceeded its hard timeout.
    #[error("stage `{stage_type}` timed out")]
    StageTimeout {
        /// The stage that ran over.
        stage_type: String,
    },

    /// The whole pipeline exceeded its time cap.
    #[error("pipeline timed out")]
    PipelineTimeout,

    /// A `$name` reference had no value in the run context.
    #[error("unresolved ${name}")]
    UnresolvedValue {
        /// The missing value name (without the `$`).
        name: String,
    },

    /// Monitor field validation failure.
    #[error("{0}")]
    Validation(String),

    /// Unexpected stage-internal failure.
    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-readable kind used when a stage error is converted to
    /// a `down` message (`"{stage}: {kind}"`).
    #[must_use]
    pub fn kind(&self) -> String {
        match self {
            Self::UnknownStage { .. } => "unknown_stage".into(),
            Self::StageConfig { reason, .. } => reason.clone(),
            Self::BadPipeline { .. } => "pipeline_invalid".into(),
            Self::StageTimeout { .. } => "timeout".into(),
            Self::PipelineTimeout => "pipeline_timeout".into(),
            Self::UnresolvedValue { name } => format!("unresolved ${name}"),
            Self::Validation(reason) => reason.clone(),
            Self::Internal(reason) => reason.clone(),
        }
    }

    /// True for errors that indicate a misconfigured monitor rather than a
    /// failing target; the API surfaces these as 400s.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownStage { .. }
                | Self::StageConfig { .. }
                | Self::BadPipeline { .. }
                | Self::Validation(_)
        )
    }
}
