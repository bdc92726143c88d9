// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! REST surface of the upwatch engine.
//!
//! Thin adapter over the core: monitor CRUD with full configuration-time
//! validation, ad-hoc check runs, historical results, and stage metadata.
//! Stage failures never surface here as errors; only configuration
//! problems (400), missing monitors (404), and storage failures (500) do.

use axum::{
    extract::{Path as AxPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use upw_core::{CheckResult, EngineError, Monitor, MonitorSpec};
use upw_engine::Engine;
use upw_scheduler::SchedulerHandle;
use upw_store::{MonitorStore, StoreError};

/// Default page size for `GET /api/monitors/{id}/results`.
const DEFAULT_RESULTS_LIMIT: u32 = 100;

/// Shared state behind every handler.
pub struct AppState {
    /// The pipeline executor (shared with the scheduler).
    pub engine: Arc<Engine>,
    /// Storage handle.
    pub store: Arc<dyn MonitorStore>,
    /// Scheduler control handle for CRUD reactions.
    pub scheduler: SchedulerHandle,
    /// Concurrency bound for `check-all`.
    pub max_concurrent_checks: usize,
}

#[derive(Debug, Deserialize)]
pub struct TagQuery {
    pub tag: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    #[serde(default)]
    pub verbose: bool,
}

/// Structured API error: status code plus a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, what)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = if err.is_config_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self::new(status, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MonitorNotFound(id) => Self::not_found(format!("monitor `{id}` not found")),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

/// Build the Axum router with all daemon routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/api/stages", get(cmd_stages))
        .route("/api/monitors", get(cmd_list_monitors).post(cmd_create_monitor))
        .route("/api/monitors/tags", get(cmd_list_tags))
        .route("/api/monitors/check-all", post(cmd_check_all))
        .route(
            "/api/monitors/{id}",
            get(cmd_get_monitor)
                .put(cmd_update_monitor)
                .delete(cmd_delete_monitor),
        )
        .route("/api/monitors/{id}/check", post(cmd_run_check))
        .route("/api/monitors/{id}/results", get(cmd_list_results))
        .with_state(state)
}

async fn cmd_health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn cmd_stages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.registry().metas())
}

async fn cmd_list_monitors(
    Query(q): Query<TagQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Monitor>>, ApiError> {
    Ok(Json(state.store.list_monitors(q.tag.as_deref()).await?))
}

async fn cmd_create_monitor(
    State(state): State<Arc<AppState>>,
    Json(mut spec): Json<MonitorSpec>,
) -> Result<(StatusCode, Json<Monitor>), ApiError> {
    validate_spec(&state, &mut spec)?;
    let monitor = Monitor::from_spec(spec, Utc::now());
    let monitor = state.store.create_monitor(monitor).await?;
    state.scheduler.sync_monitor(&monitor.id).await;
    info!(target: "upw.daemon", monitor_id = %monitor.id, name = %monitor.name, "monitor created");
    Ok((StatusCode::CREATED, Json(monitor)))
}

async fn cmd_get_monitor(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Monitor>, ApiError> {
    state
        .store
        .get_monitor(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("monitor `{id}` not found")))
}

async fn cmd_update_monitor(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
    Json(mut spec): Json<MonitorSpec>,
) -> Result<Json<Monitor>, ApiError> {
    validate_spec(&state, &mut spec)?;
    let existing = state
        .store
        .get_monitor(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("monitor `{id}` not found")))?;

    let mut updated = existing.clone();
    updated.apply_spec(spec, Utc::now());
    let updated = state.store.update_monitor(updated).await?;

    // Cosmetic-only edits (name, tags) leave the job untouched.
    if existing.schedule_relevant_change(&updated) {
        state.scheduler.sync_monitor(&updated.id).await;
    }
    Ok(Json(updated))
}

async fn cmd_delete_monitor(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, ApiError> {
    if !state.store.delete_monitor(&id).await? {
        return Err(ApiError::not_found(format!("monitor `{id}` not found")));
    }
    state.scheduler.remove_monitor(&id).await;
    info!(target: "upw.daemon", monitor_id = %id, "monitor deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn cmd_run_check(
    AxPath(id): AxPath<String>,
    Query(q): Query<CheckQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<CheckResult>, ApiError> {
    let monitor = state
        .store
        .get_monitor(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("monitor `{id}` not found")))?;
    let result = state.engine.run_and_record(&monitor, q.verbose).await?;
    Ok(Json(result))
}

async fn cmd_check_all(
    Query(q): Query<TagQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CheckResult>>, ApiError> {
    let monitors = state.store.list_monitors(q.tag.as_deref()).await?;
    let engine = state.engine.clone();

    // Same bound as the scheduler's worker pool.
    let results: Vec<CheckResult> = futures::stream::iter(monitors)
        .map(|monitor| {
            let engine = engine.clone();
            async move { engine.run_and_record(&monitor, false).await }
        })
        .buffer_unordered(state.max_concurrent_checks.max(1))
        .filter_map(|outcome| async move {
            match outcome {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::warn!(target: "upw.daemon", error = %e, "check-all result dropped");
                    None
                }
            }
        })
        .collect()
        .await;

    Ok(Json(results))
}

async fn cmd_list_results(
    AxPath(id): AxPath<String>,
    Query(q): Query<ResultsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CheckResult>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_RESULTS_LIMIT);
    Ok(Json(state.store.list_results(&id, limit).await?))
}

async fn cmd_list_tags(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.store.list_tags().await?))
}

/// Full configuration-time validation of a monitor spec: field shapes,
/// pipeline resolution against the registry (at least one network stage,
/// options accepted by every constructor), and cron syntax.
fn validate_spec(state: &AppState, spec: &mut MonitorSpec) -> Result<(), ApiError> {
    upw_core::normalize_spec(spec)?;
    state.engine.validate_pipeline(&spec.pipeline)?;
    if let Some(expr) = spec.schedule.as_deref() {
        upw_scheduler::parse_cron(expr)?;
    }
    Ok(())
}
