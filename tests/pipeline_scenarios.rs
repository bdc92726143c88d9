// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end pipeline scenarios: literal inputs through the executor and
//! store, asserting the exact aggregate verdicts, messages, and details.

use serde_json::json;
use std::sync::Arc;
use upw_core::{CheckStatus, Monitor, MonitorSpec, StageSpec};
use upw_engine::Engine;
use upw_stages::StageRegistry;
use upw_store::{MonitorStore, SqliteStore};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn fixture(retention: u32) -> (Arc<Engine>, Arc<SqliteStore>) {
    let store = Arc::new(
        SqliteStore::connect("sqlite::memory:", retention)
            .await
            .unwrap(),
    );
    let registry = Arc::new(StageRegistry::with_builtin_stages());
    (Arc::new(Engine::new(registry, store.clone())), store)
}

fn monitor(url: &str, pipeline: Vec<StageSpec>) -> Monitor {
    Monitor::from_spec(
        MonitorSpec {
            name: "g".into(),
            url: url.into(),
            pipeline,
            interval: 30,
            schedule: None,
            enabled: true,
            tags: vec![],
        },
        chrono::Utc::now(),
    )
}

async fn serve_json(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body.to_string())
                .insert_header("content-type", "application/json"),
        )
        .mount(&server)
        .await;
    server
}

fn counting_pipeline(min: u64, max: u64) -> Vec<StageSpec> {
    vec![
        StageSpec::new("http"),
        StageSpec::new("jq")
            .option("expr", json!(".count"))
            .option("store_as", json!("c")),
        StageSpec::new("threshold")
            .option("value", json!("$c"))
            .option("min", json!(min))
            .option("max", json!(max)),
    ]
}

#[tokio::test]
async fn minimal_http_monitor_reports_up() {
    let (engine, _) = fixture(100).await;
    let server = serve_json("hello").await;

    let result = engine
        .execute(&monitor(&server.uri(), vec![StageSpec::new("http")]), false)
        .await;

    assert_eq!(result.status, CheckStatus::Up);
    assert_eq!(result.message, "http: 200");
    assert_eq!(result.details["http"]["status_code"], json!(200));
}

#[tokio::test]
async fn chained_json_assertion_passes_with_all_stage_names() {
    let (engine, _) = fixture(100).await;
    let server = serve_json(r#"{"count": 42}"#).await;

    let result = engine
        .execute(&monitor(&server.uri(), counting_pipeline(10, 100)), false)
        .await;

    assert_eq!(result.status, CheckStatus::Up);
    for name in ["http", "jq", "threshold"] {
        assert!(result.message.contains(name), "message: {}", result.message);
        assert!(result.details.contains_key(name), "missing details.{name}");
    }
}

#[tokio::test]
async fn failed_assertion_short_circuits() {
    let (engine, _) = fixture(100).await;
    let server = serve_json(r#"{"count": 42}"#).await;

    let mut pipeline = counting_pipeline(100, 1000);
    pipeline.push(StageSpec::new("contains").option("pattern", json!("count")));
    let result = engine.execute(&monitor(&server.uri(), pipeline), false).await;

    assert_eq!(result.status, CheckStatus::Down);
    assert!(
        result.message.ends_with("threshold: out_of_range"),
        "message: {}",
        result.message
    );
    assert!(result.details.contains_key("threshold"));
    assert!(!result.details.contains_key("contains"));
}

#[tokio::test]
async fn network_failure_reports_transport_error() {
    let (engine, _) = fixture(100).await;

    let result = engine
        .execute(
            &monitor("http://127.0.0.1:1/", vec![StageSpec::new("http")]),
            false,
        )
        .await;

    assert_eq!(result.status, CheckStatus::Down);
    assert_eq!(result.message, "http: transport_error");
    assert!(result.elapsed_ms > 0.0);
    assert!(result.details["http"]["error"].is_string());
}

#[tokio::test]
async fn retention_keeps_only_the_newest_results() {
    let (engine, store) = fixture(3).await;
    let server = serve_json("ok").await;
    let m = monitor(&server.uri(), vec![StageSpec::new("http")]);
    store.create_monitor(m.clone()).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let result = engine.run_and_record(&m, false).await.unwrap();
        ids.push(result.id);
        // Space the runs out so checked_at ordering is unambiguous.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let kept = store.list_results(&m.id, 10).await.unwrap();
    assert_eq!(kept.len(), 3);
    let kept_ids: Vec<_> = kept.iter().map(|r| r.id.clone()).collect();
    let mut expected: Vec<_> = ids[2..].to_vec();
    expected.reverse();
    assert_eq!(kept_ids, expected, "newest first, last three inserted");
}

#[tokio::test]
async fn header_and_age_stages_compose() {
    let server = MockServer::start().await;
    let stamp = (chrono::Utc::now() - chrono::TimeDelta::seconds(30)).to_rfc3339();
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(json!({ "exported_at": stamp }).to_string())
                .insert_header("x-build", "1724"),
        )
        .mount(&server)
        .await;

    let (engine, _) = fixture(100).await;
    let pipeline = vec![
        StageSpec::new("http"),
        StageSpec::new("header")
            .option("pattern", json!("X-Build"))
            .option("store_as", json!("build")),
        StageSpec::new("threshold")
            .option("value", json!("$build"))
            .option("min", json!(1000)),
        StageSpec::new("jsonpath")
            .option("expr", json!("$.exported_at"))
            .option("store_as", json!("stamp")),
        StageSpec::new("age")
            .option("value", json!("$stamp"))
            .option("max_age", json!(120)),
    ];

    let result = engine.execute(&monitor(&server.uri(), pipeline), false).await;
    assert_eq!(result.status, CheckStatus::Up, "message: {}", result.message);
    for key in ["http", "header", "threshold", "jsonpath", "age"] {
        assert!(result.details.contains_key(key), "missing details.{key}");
    }
}

#[tokio::test]
async fn elapsed_ms_reference_feeds_latency_assertions() {
    let (engine, _) = fixture(100).await;
    let server = serve_json("ok").await;

    let pipeline = vec![
        StageSpec::new("http"),
        StageSpec::new("threshold")
            .option("value", json!("$elapsed_ms"))
            .option("max", json!(30_000)),
    ];
    let result = engine.execute(&monitor(&server.uri(), pipeline), false).await;
    assert_eq!(result.status, CheckStatus::Up, "message: {}", result.message);
}
