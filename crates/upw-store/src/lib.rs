// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! upw-store
//!
//! The single durable collaborator of the engine: monitor CRUD, the
//! append-only result log with bounded retention, and scheduler-job
//! persistence. Every call is atomic on its own; no multi-call
//! transactions are required by the contract.

/// SQLite implementation of the storage contract.
pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use upw_core::{CheckResult, CheckStatus, Monitor};

/// Errors surfaced by the storage layer.
///
/// API writes translate these to 500s; the scheduler logs and drops the
/// affected result instead of crashing a worker.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(String),

    /// A persisted payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The referenced monitor does not exist.
    #[error("monitor `{0}` not found")]
    MonitorNotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Persisted scheduler-job state: enough to answer "what jobs exist, what
/// are their triggers, when do they next fire" across restarts.
///
/// The engine owns this collection; external observers treat it as opaque.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerJob {
    /// Job identity (one job per monitor).
    pub monitor_id: String,
    /// `"interval"` or `"cron"`.
    pub trigger_kind: String,
    /// Serialized trigger payload (seconds, or the cron expression).
    pub trigger_spec: String,
    /// Next fire hint, refreshed on each successful registration/fire.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Last time this record was written.
    pub last_updated: DateTime<Utc>,
}

/// The storage contract as seen by the engine, the scheduler, and the API.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// Persist a freshly created monitor snapshot.
    async fn create_monitor(&self, monitor: Monitor) -> Result<Monitor, StoreError>;

    /// Fetch one monitor by id.
    async fn get_monitor(&self, id: &str) -> Result<Option<Monitor>, StoreError>;

    /// List monitors, optionally filtered by tag membership.
    async fn list_monitors(&self, tag: Option<&str>) -> Result<Vec<Monitor>, StoreError>;

    /// Replace a monitor snapshot in place (id immutable).
    ///
    /// # Errors
    ///
    /// [`StoreError::MonitorNotFound`] when the id does not exist.
    async fn update_monitor(&self, monitor: Monitor) -> Result<Monitor, StoreError>;

    /// Delete a monitor; existing results become orphan history.
    ///
    /// Returns `false` when the id did not exist.
    async fn delete_monitor(&self, id: &str) -> Result<bool, StoreError>;

    /// Sorted, deduplicated union of all monitors' tags.
    async fn list_tags(&self) -> Result<Vec<String>, StoreError>;

    /// Append a check result, idempotently by `result.id`, then evict the
    /// oldest results for that monitor beyond the retention cap.
    async fn append_result(&self, result: &CheckResult) -> Result<(), StoreError>;

    /// Newest-first results for a monitor; `limit` is capped at
    /// [`upw_core::MAX_RESULTS_LIMIT`].
    async fn list_results(
        &self,
        monitor_id: &str,
        limit: u32,
    ) -> Result<Vec<CheckResult>, StoreError>;

    /// Refresh the monitor's `last_check`/`last_status` mirror.
    ///
    /// Best-effort denormalization: loss is tolerated because the mirror is
    /// re-derivable from the result log.
    async fn update_monitor_mirror(
        &self,
        id: &str,
        last_check: DateTime<Utc>,
        last_status: CheckStatus,
    ) -> Result<(), StoreError>;

    /// Insert or replace a scheduler job record.
    async fn upsert_job(&self, job: &SchedulerJob) -> Result<(), StoreError>;

    /// Remove a scheduler job record, if present.
    async fn delete_job(&self, monitor_id: &str) -> Result<(), StoreError>;

    /// All persisted scheduler job records.
    async fn list_jobs(&self) -> Result<Vec<SchedulerJob>, StoreError>;
}
