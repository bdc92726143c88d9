// SPDX-License-Identifier: MIT OR Apache-2.0
//! Endpoint tests for the daemon REST surface: validation boundaries,
//! CRUD round-trips, stage metadata, and ad-hoc checks.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use upw_daemon::{build_app, AppState};
use upw_engine::Engine;
use upw_scheduler::{Scheduler, SchedulerConfig};
use upw_stages::StageRegistry;
use upw_store::SqliteStore;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn test_app() -> axum::Router {
    let store = Arc::new(SqliteStore::connect("sqlite::memory:", 100).await.unwrap());
    let registry = Arc::new(StageRegistry::with_builtin_stages());
    let engine = Arc::new(Engine::new(registry, store.clone()));
    let scheduler = Scheduler::start(
        engine.clone(),
        store.clone(),
        SchedulerConfig {
            max_concurrent_checks: 4,
            ..SchedulerConfig::default()
        },
    )
    .await
    .unwrap();

    build_app(Arc::new(AppState {
        engine,
        store,
        scheduler,
        max_concurrent_checks: 4,
    }))
}

fn monitor_body(name: &str, url: &str) -> Value {
    json!({
        "name": name,
        "url": url,
        "pipeline": [{"type": "http"}],
        "interval": 30,
        "enabled": true,
        "tags": []
    })
}

async fn request(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

// ---------------------------------------------------------------------------
// Health and metadata
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_healthy() {
    let app = test_app().await;
    let (status, body) = request(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn stages_endpoint_lists_metadata_with_options() {
    let app = test_app().await;
    let (status, body) = request(&app, "GET", "/api/stages", None).await;
    assert_eq!(status, StatusCode::OK);

    let stages = body.as_array().unwrap();
    assert_eq!(stages.len(), 12);
    let http = stages.iter().find(|s| s["type"] == "http").unwrap();
    assert_eq!(http["is_network_stage"], json!(true));
    let timeout = http["options"]
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["name"] == "timeout")
        .unwrap();
    assert_eq!(timeout["default"], json!("10"));
    assert_eq!(timeout["required"], json!(false));
}

// ---------------------------------------------------------------------------
// Creation boundaries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_round_trips_caller_set_fields() {
    let app = test_app().await;
    let mut body = monitor_body("g", "https://example.com");
    body["tags"] = json!(["prod", "web", "prod"]);

    let (status, created) = request(&app, "POST", "/api/monitors", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "g");
    assert_eq!(created["url"], "https://example.com");
    assert_eq!(created["tags"], json!(["prod", "web"]));

    let id = created["id"].as_str().unwrap();
    let (status, fetched) = request(&app, "GET", &format!("/api/monitors/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    for field in ["name", "url", "pipeline", "interval", "enabled", "tags"] {
        assert_eq!(fetched[field], created[field], "field {field}");
    }
}

#[tokio::test]
async fn create_defaults_missing_scheme_to_https() {
    let app = test_app().await;
    let (status, created) =
        request(&app, "POST", "/api/monitors", Some(monitor_body("g", "example.com"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["url"], "https://example.com");
}

#[tokio::test]
async fn interval_floor_is_ten_seconds() {
    let app = test_app().await;

    let mut body = monitor_body("g", "https://example.com");
    body["interval"] = json!(9);
    let (status, _) = request(&app, "POST", "/api/monitors", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut body = monitor_body("g", "https://example.com");
    body["interval"] = json!(10);
    let (status, _) = request(&app, "POST", "/api/monitors", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn empty_pipeline_is_rejected() {
    let app = test_app().await;
    let mut body = monitor_body("g", "https://example.com");
    body["pipeline"] = json!([]);
    let (status, err) = request(&app, "POST", "/api/monitors", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].as_str().unwrap().contains("pipeline"));
}

#[tokio::test]
async fn extractor_only_pipeline_is_rejected() {
    let app = test_app().await;
    let mut body = monitor_body("g", "https://example.com");
    body["pipeline"] = json!([{"type": "regex", "pattern": "ok"}]);
    let (status, err) = request(&app, "POST", "/api/monitors", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].as_str().unwrap().contains("network"));
}

#[tokio::test]
async fn unknown_stage_type_is_rejected() {
    let app = test_app().await;
    let mut body = monitor_body("g", "https://example.com");
    body["pipeline"] = json!([{"type": "telepathy"}]);
    let (status, err) = request(&app, "POST", "/api/monitors", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].as_str().unwrap().contains("telepathy"));
}

#[tokio::test]
async fn bad_stage_options_are_rejected() {
    let app = test_app().await;
    let mut body = monitor_body("g", "https://example.com");
    body["pipeline"] = json!([{"type": "http"}, {"type": "threshold", "value": "$c"}]);
    let (status, err) = request(&app, "POST", "/api/monitors", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].as_str().unwrap().contains("min"));
}

#[tokio::test]
async fn url_length_boundary_is_2048() {
    let app = test_app().await;

    let url = format!("https://{}", "a".repeat(2041));
    assert_eq!(url.len(), 2049);
    let (status, _) = request(&app, "POST", "/api/monitors", Some(monitor_body("g", &url))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let url = format!("https://{}", "a".repeat(2040));
    assert_eq!(url.len(), 2048);
    let (status, _) = request(&app, "POST", "/api/monitors", Some(monitor_body("g", &url))).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn cron_schedule_must_have_five_fields() {
    let app = test_app().await;

    let mut body = monitor_body("g", "https://example.com");
    body["schedule"] = json!("*/5 * *");
    let (status, _) = request(&app, "POST", "/api/monitors", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut body = monitor_body("g", "https://example.com");
    body["schedule"] = json!("*/5 * * * *");
    let (status, created) = request(&app, "POST", "/api/monitors", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["schedule"], "*/5 * * * *");
}

// ---------------------------------------------------------------------------
// Update / delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_updates_differ_only_in_updated_at() {
    let app = test_app().await;
    let (_, created) =
        request(&app, "POST", "/api/monitors", Some(monitor_body("g", "https://example.com"))).await;
    let id = created["id"].as_str().unwrap().to_string();

    let mut patch = monitor_body("renamed", "https://example.com");
    patch["tags"] = json!(["web"]);
    let (status, first) =
        request(&app, "PUT", &format!("/api/monitors/{id}"), Some(patch.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, second) =
        request(&app, "PUT", &format!("/api/monitors/{id}"), Some(patch)).await;
    assert_eq!(status, StatusCode::OK);

    let mut a = first.clone();
    let mut b = second.clone();
    a.as_object_mut().unwrap().remove("updated_at");
    b.as_object_mut().unwrap().remove("updated_at");
    assert_eq!(a, b);
    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["created_at"], second["created_at"]);
}

#[tokio::test]
async fn update_missing_monitor_is_404() {
    let app = test_app().await;
    let (status, _) = request(
        &app,
        "PUT",
        "/api/monitors/ghost",
        Some(monitor_body("g", "https://example.com")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_returns_204_then_404() {
    let app = test_app().await;
    let (_, created) =
        request(&app, "POST", "/api/monitors", Some(monitor_body("g", "https://example.com"))).await;
    let id = created["id"].as_str().unwrap().to_string();

    let (status, _) = request(&app, "DELETE", &format!("/api/monitors/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = request(&app, "DELETE", &format!("/api/monitors/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = request(&app, "GET", &format!("/api/monitors/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Listing, tags, results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_monitors_filters_by_tag() {
    let app = test_app().await;
    let mut a = monitor_body("a", "https://a.example.com");
    a["tags"] = json!(["prod"]);
    let mut b = monitor_body("b", "https://b.example.com");
    b["tags"] = json!(["dev"]);
    request(&app, "POST", "/api/monitors", Some(a)).await;
    request(&app, "POST", "/api/monitors", Some(b)).await;

    let (_, all) = request(&app, "GET", "/api/monitors", None).await;
    assert_eq!(all.as_array().unwrap().len(), 2);
    let (_, prod) = request(&app, "GET", "/api/monitors?tag=prod", None).await;
    assert_eq!(prod.as_array().unwrap().len(), 1);
    assert_eq!(prod[0]["name"], "a");
}

#[tokio::test]
async fn tags_are_sorted_and_deduplicated() {
    let app = test_app().await;
    let mut a = monitor_body("a", "https://a.example.com");
    a["tags"] = json!(["web", "prod"]);
    let mut b = monitor_body("b", "https://b.example.com");
    b["tags"] = json!(["prod", "api"]);
    request(&app, "POST", "/api/monitors", Some(a)).await;
    request(&app, "POST", "/api/monitors", Some(b)).await;

    let (status, tags) = request(&app, "GET", "/api/monitors/tags", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tags, json!(["api", "prod", "web"]));
}

#[tokio::test]
async fn results_for_a_fresh_monitor_are_empty() {
    let app = test_app().await;
    let (_, created) =
        request(&app, "POST", "/api/monitors", Some(monitor_body("g", "https://example.com"))).await;
    let id = created["id"].as_str().unwrap();

    let (status, results) =
        request(&app, "GET", &format!("/api/monitors/{id}/results?limit=5"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results, json!([]));
}

// ---------------------------------------------------------------------------
// Ad-hoc checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_check_on_missing_monitor_is_404() {
    let app = test_app().await;
    let (status, _) = request(&app, "POST", "/api/monitors/ghost/check", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn run_check_returns_and_persists_the_result() {
    let app = test_app().await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let (_, created) =
        request(&app, "POST", "/api/monitors", Some(monitor_body("g", &server.uri()))).await;
    let id = created["id"].as_str().unwrap();

    let (status, result) =
        request(&app, "POST", &format!("/api/monitors/{id}/check"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "up");
    assert_eq!(result["message"], "http: 200");
    assert_eq!(result["monitor_id"], *id);

    let (_, results) =
        request(&app, "GET", &format!("/api/monitors/{id}/results"), None).await;
    assert_eq!(results.as_array().unwrap().len(), 1);

    // The mirror caught up too.
    let (_, fetched) = request(&app, "GET", &format!("/api/monitors/{id}"), None).await;
    assert_eq!(fetched["last_status"], "up");
}

#[tokio::test]
async fn check_all_runs_every_matching_monitor() {
    let app = test_app().await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let mut a = monitor_body("a", &server.uri());
    a["tags"] = json!(["prod"]);
    let mut b = monitor_body("b", &server.uri());
    b["tags"] = json!(["dev"]);
    request(&app, "POST", "/api/monitors", Some(a)).await;
    request(&app, "POST", "/api/monitors", Some(b)).await;

    let (status, all) = request(&app, "POST", "/api/monitors/check-all", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (_, prod) = request(&app, "POST", "/api/monitors/check-all?tag=prod", None).await;
    assert_eq!(prod.as_array().unwrap().len(), 1);
}
