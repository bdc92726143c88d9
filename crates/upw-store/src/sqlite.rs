// SPDX-License-Identifier: MIT OR Apache-2.0
//! SQLite-backed implementation of [`MonitorStore`].
//!
//! Three tables mirror the contract's logical collections: `monitors`,
//! `results` (indexed by monitor and recency), and `scheduler_jobs`.
//! Timestamps are RFC 3339 text with millisecond precision, so recency
//! ordering is plain lexicographic ordering; JSON payloads (pipeline, tags,
//! details) are serialized text columns.

use crate::{MonitorStore, SchedulerJob, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use upw_core::{CheckResult, CheckStatus, Monitor, MAX_RESULTS_LIMIT};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS monitors (
        id            TEXT PRIMARY KEY,
        name          TEXT NOT NULL,
        url           TEXT NOT NULL,
        pipeline      TEXT NOT NULL,
        interval_secs INTEGER NOT NULL,
        schedule      TEXT,
        enabled       INTEGER NOT NULL,
        tags          TEXT NOT NULL,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL,
        last_check    TEXT,
        last_status   TEXT
    )",
    "CREATE TABLE IF NOT EXISTS results (
        id         TEXT PRIMARY KEY,
        monitor_id TEXT NOT NULL,
        checked_at TEXT NOT NULL,
        status     TEXT NOT NULL,
        message    TEXT NOT NULL,
        elapsed_ms REAL NOT NULL,
        details    TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_results_monitor_recency
        ON results (monitor_id, checked_at DESC)",
    "CREATE TABLE IF NOT EXISTS scheduler_jobs (
        monitor_id   TEXT PRIMARY KEY,
        trigger_kind TEXT NOT NULL,
        trigger_spec TEXT NOT NULL,
        next_run_at  TEXT,
        last_updated TEXT NOT NULL
    )",
];

/// SQLite store holding all three collections behind one pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    retention: u32,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and bootstrap the
    /// schema. `retention` caps the per-monitor result log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the URL is malformed or the
    /// database cannot be opened.
    pub async fn connect(url: &str, retention: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Database(format!("invalid database url `{url}`: {e}")))?
            .create_if_missing(true);

        // A pooled `:memory:` database is one database per connection; pin
        // the pool to a single connection so tests see consistent state.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool, retention };
        store.init_schema().await?;
        Ok(store)
    }

    /// Per-monitor result retention this store enforces.
    #[must_use]
    pub fn retention(&self) -> u32 {
        self.retention
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn format_dt(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_dt(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp `{raw}`: {e}")))
}

fn monitor_from_row(row: &SqliteRow) -> Result<Monitor, StoreError> {
    let pipeline: String = row.try_get("pipeline")?;
    let tags: String = row.try_get("tags")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let last_check: Option<String> = row.try_get("last_check")?;
    let last_status: Option<String> = row.try_get("last_status")?;
    let interval: i64 = row.try_get("interval_secs")?;
    let enabled: i64 = row.try_get("enabled")?;

    Ok(Monitor {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        pipeline: serde_json::from_str(&pipeline)?,
        interval: interval.max(0) as u64,
        schedule: row.try_get("schedule")?,
        enabled: enabled != 0,
        tags: serde_json::from_str(&tags)?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
        last_check: last_check.as_deref().map(parse_dt).transpose()?,
        last_status: last_status
            .as_deref()
            .map(|s| {
                CheckStatus::from_str(s)
                    .map_err(|_| StoreError::Serialization(format!("bad status `{s}`")))
            })
            .transpose()?,
    })
}

fn result_from_row(row: &SqliteRow) -> Result<CheckResult, StoreError> {
    let checked_at: String = row.try_get("checked_at")?;
    let status: String = row.try_get("status")?;
    let details: String = row.try_get("details")?;

    Ok(CheckResult {
        id: row.try_get("id")?,
        monitor_id: row.try_get("monitor_id")?,
        checked_at: parse_dt(&checked_at)?,
        status: CheckStatus::from_str(&status)
            .map_err(|_| StoreError::Serialization(format!("bad status `{status}`")))?,
        message: row.try_get("message")?,
        elapsed_ms: row.try_get("elapsed_ms")?,
        details: serde_json::from_str(&details)?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<SchedulerJob, StoreError> {
    let next_run_at: Option<String> = row.try_get("next_run_at")?;
    let last_updated: String = row.try_get("last_updated")?;
    Ok(SchedulerJob {
        monitor_id: row.try_get("monitor_id")?,
        trigger_kind: row.try_get("trigger_kind")?,
        trigger_spec: row.try_get("trigger_spec")?,
        next_run_at: next_run_at.as_deref().map(parse_dt).transpose()?,
        last_updated: parse_dt(&last_updated)?,
    })
}

#[async_trait]
impl MonitorStore for SqliteStore {
    async fn create_monitor(&self, monitor: Monitor) -> Result<Monitor, StoreError> {
        sqlx::query(
            "INSERT INTO monitors
                (id, name, url, pipeline, interval_secs, schedule, enabled, tags,
                 created_at, updated_at, last_check, last_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, NULL)",
        )
        .bind(&monitor.id)
        .bind(&monitor.name)
        .bind(&monitor.url)
        .bind(serde_json::to_string(&monitor.pipeline)?)
        .bind(monitor.interval as i64)
        .bind(&monitor.schedule)
        .bind(i64::from(monitor.enabled))
        .bind(serde_json::to_string(&monitor.tags)?)
        .bind(format_dt(&monitor.created_at))
        .bind(format_dt(&monitor.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(monitor)
    }

    async fn get_monitor(&self, id: &str) -> Result<Option<Monitor>, StoreError> {
        let row = sqlx::query("SELECT * FROM monitors WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(monitor_from_row).transpose()
    }

    async fn list_monitors(&self, tag: Option<&str>) -> Result<Vec<Monitor>, StoreError> {
        let rows = sqlx::query("SELECT * FROM monitors ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        let mut monitors = Vec::with_capacity(rows.len());
        for row in &rows {
            let monitor = monitor_from_row(row)?;
            if tag.is_none_or(|t| monitor.tags.iter().any(|have| have == t)) {
                monitors.push(monitor);
            }
        }
        Ok(monitors)
    }

    async fn update_monitor(&self, monitor: Monitor) -> Result<Monitor, StoreError> {
        let updated = sqlx::query(
            "UPDATE monitors
                SET name = ?2, url = ?3, pipeline = ?4, interval_secs = ?5,
                    schedule = ?6, enabled = ?7, tags = ?8, updated_at = ?9
              WHERE id = ?1",
        )
        .bind(&monitor.id)
        .bind(&monitor.name)
        .bind(&monitor.url)
        .bind(serde_json::to_string(&monitor.pipeline)?)
        .bind(monitor.interval as i64)
        .bind(&monitor.schedule)
        .bind(i64::from(monitor.enabled))
        .bind(serde_json::to_string(&monitor.tags)?)
        .bind(format_dt(&monitor.updated_at))
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::MonitorNotFound(monitor.id));
        }
        Ok(monitor)
    }

    async fn delete_monitor(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM monitors WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn list_tags(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT tags FROM monitors")
            .fetch_all(&self.pool)
            .await?;
        let mut union = std::collections::BTreeSet::new();
        for row in &rows {
            let raw: String = row.try_get("tags")?;
            let tags: Vec<String> = serde_json::from_str(&raw)?;
            union.extend(tags);
        }
        Ok(union.into_iter().collect())
    }

    async fn append_result(&self, result: &CheckResult) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO results
                (id, monitor_id, checked_at, status, message, elapsed_ms, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&result.id)
        .bind(&result.monitor_id)
        .bind(format_dt(&result.checked_at))
        .bind(result.status.as_str())
        .bind(&result.message)
        .bind(result.elapsed_ms)
        .bind(serde_json::to_string(&result.details)?)
        .execute(&self.pool)
        .await?;

        // Evict beyond retention, oldest first.
        sqlx::query(
            "DELETE FROM results
              WHERE monitor_id = ?1
                AND id NOT IN (
                    SELECT id FROM results
                     WHERE monitor_id = ?1
                     ORDER BY checked_at DESC, id DESC
                     LIMIT ?2
                )",
        )
        .bind(&result.monitor_id)
        .bind(i64::from(self.retention))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_results(
        &self,
        monitor_id: &str,
        limit: u32,
    ) -> Result<Vec<CheckResult>, StoreError> {
        let limit = limit.min(MAX_RESULTS_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM results
              WHERE monitor_id = ?1
              ORDER BY checked_at DESC, id DESC
              LIMIT ?2",
        )
        .bind(monitor_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    async fn update_monitor_mirror(
        &self,
        id: &str,
        last_check: DateTime<Utc>,
        last_status: CheckStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE monitors SET last_check = ?2, last_status = ?3 WHERE id = ?1")
            .bind(id)
            .bind(format_dt(&last_check))
            .bind(last_status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_job(&self, job: &SchedulerJob) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scheduler_jobs
                (monitor_id, trigger_kind, trigger_spec, next_run_at, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (monitor_id) DO UPDATE SET
                trigger_kind = excluded.trigger_kind,
                trigger_spec = excluded.trigger_spec,
                next_run_at = excluded.next_run_at,
                last_updated = excluded.last_updated",
        )
        .bind(&job.monitor_id)
        .bind(&job.trigger_kind)
        .bind(&job.trigger_spec)
        .bind(job.next_run_at.as_ref().map(format_dt))
        .bind(format_dt(&job.last_updated))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_job(&self, monitor_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM scheduler_jobs WHERE monitor_id = ?1")
            .bind(monitor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<SchedulerJob>, StoreError> {
        let rows = sqlx::query("SELECT * FROM scheduler_jobs ORDER BY monitor_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use upw_core::{MonitorSpec, StageSpec};

    async fn memory_store(retention: u32) -> SqliteStore {
        SqliteStore::connect("sqlite::memory:", retention)
            .await
            .expect("open in-memory store")
    }

    fn monitor(name: &str, tags: &[&str]) -> Monitor {
        Monitor::from_spec(
            MonitorSpec {
                name: name.into(),
                url: "https://example.com".into(),
                pipeline: vec![StageSpec::new("http")],
                interval: 30,
                schedule: None,
                enabled: true,
                tags: tags.iter().map(ToString::to_string).collect(),
            },
            Utc::now(),
        )
    }

    fn result_for(monitor_id: &str, checked_at: DateTime<Utc>) -> CheckResult {
        CheckResult {
            id: CheckResult::new_id(),
            monitor_id: monitor_id.into(),
            checked_at,
            status: CheckStatus::Up,
            message: "http: 200".into(),
            elapsed_ms: 12.5,
            details: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips_all_fields() {
        let store = memory_store(100).await;
        let m = monitor("api", &["prod", "web"]);
        store.create_monitor(m.clone()).await.unwrap();

        let loaded = store.get_monitor(&m.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, m.name);
        assert_eq!(loaded.url, m.url);
        assert_eq!(loaded.pipeline, m.pipeline);
        assert_eq!(loaded.interval, m.interval);
        assert_eq!(loaded.tags, m.tags);
        assert_eq!(loaded.enabled, m.enabled);
        assert!(loaded.last_check.is_none());
    }

    #[tokio::test]
    async fn list_monitors_filters_by_tag_membership() {
        let store = memory_store(100).await;
        store.create_monitor(monitor("a", &["prod"])).await.unwrap();
        store.create_monitor(monitor("b", &["dev"])).await.unwrap();
        store
            .create_monitor(monitor("c", &["prod", "dev"]))
            .await
            .unwrap();

        assert_eq!(store.list_monitors(None).await.unwrap().len(), 3);
        let prod = store.list_monitors(Some("prod")).await.unwrap();
        assert_eq!(prod.len(), 2);
        assert!(prod.iter().all(|m| m.tags.iter().any(|t| t == "prod")));
    }

    #[tokio::test]
    async fn update_missing_monitor_is_not_found() {
        let store = memory_store(100).await;
        let err = store.update_monitor(monitor("ghost", &[])).await.unwrap_err();
        assert!(matches!(err, StoreError::MonitorNotFound(_)));
    }

    #[tokio::test]
    async fn delete_keeps_results_as_orphan_history() {
        let store = memory_store(100).await;
        let m = monitor("api", &[]);
        store.create_monitor(m.clone()).await.unwrap();
        store
            .append_result(&result_for(&m.id, Utc::now()))
            .await
            .unwrap();

        assert!(store.delete_monitor(&m.id).await.unwrap());
        assert!(!store.delete_monitor(&m.id).await.unwrap());
        assert!(store.get_monitor(&m.id).await.unwrap().is_none());
        assert_eq!(store.list_results(&m.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_tags_is_a_sorted_dedup_union() {
        let store = memory_store(100).await;
        store
            .create_monitor(monitor("a", &["web", "prod"]))
            .await
            .unwrap();
        store
            .create_monitor(monitor("b", &["prod", "api"]))
            .await
            .unwrap();

        assert_eq!(
            store.list_tags().await.unwrap(),
            vec!["api".to_string(), "prod".to_string(), "web".to_string()]
        );
    }

    #[tokio::test]
    async fn retention_keeps_the_newest_results() {
        let store = memory_store(3).await;
        let m = monitor("api", &[]);
        store.create_monitor(m.clone()).await.unwrap();

        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let r = result_for(&m.id, base + TimeDelta::seconds(i));
            ids.push(r.id.clone());
            store.append_result(&r).await.unwrap();
        }

        let kept = store.list_results(&m.id, 10).await.unwrap();
        assert_eq!(kept.len(), 3);
        // Newest first, matching the last three inserted.
        assert_eq!(kept[0].id, ids[4]);
        assert_eq!(kept[1].id, ids[3]);
        assert_eq!(kept[2].id, ids[2]);
    }

    #[tokio::test]
    async fn append_result_is_idempotent_by_id() {
        let store = memory_store(100).await;
        let m = monitor("api", &[]);
        store.create_monitor(m.clone()).await.unwrap();

        let r = result_for(&m.id, Utc::now());
        store.append_result(&r).await.unwrap();
        store.append_result(&r).await.unwrap();
        assert_eq!(store.list_results(&m.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mirror_update_reflects_on_the_monitor() {
        let store = memory_store(100).await;
        let m = monitor("api", &[]);
        store.create_monitor(m.clone()).await.unwrap();

        let now = Utc::now();
        store
            .update_monitor_mirror(&m.id, now, CheckStatus::Degraded)
            .await
            .unwrap();
        let loaded = store.get_monitor(&m.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_status, Some(CheckStatus::Degraded));
        assert!(loaded.last_check.is_some());
    }

    #[tokio::test]
    async fn scheduler_jobs_upsert_replace_and_delete() {
        let store = memory_store(100).await;
        let mut job = SchedulerJob {
            monitor_id: "m-1".into(),
            trigger_kind: "interval".into(),
            trigger_spec: "60".into(),
            next_run_at: Some(Utc::now()),
            last_updated: Utc::now(),
        };
        store.upsert_job(&job).await.unwrap();

        job.trigger_kind = "cron".into();
        job.trigger_spec = "*/5 * * * *".into();
        store.upsert_job(&job).await.unwrap();

        let jobs = store.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].trigger_kind, "cron");

        store.delete_job("m-1").await.unwrap();
        assert!(store.list_jobs().await.unwrap().is_empty());
    }
}
