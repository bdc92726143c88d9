// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use axum::http::HeaderValue;
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use upw_config::EngineConfig;
use upw_daemon::{build_app, AppState};
use upw_engine::Engine;
use upw_scheduler::{Scheduler, SchedulerConfig};
use upw_stages::StageRegistry;
use upw_store::SqliteStore;

#[derive(Parser, Debug)]
#[command(name = "upw-daemon", version, about = "upwatch monitoring daemon")]
struct Args {
    /// Bind address (overrides HOST/PORT).
    #[arg(long)]
    bind: Option<String>,

    /// Storage URI (overrides DATABASE_URL).
    #[arg(long)]
    database: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("upw=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("upw=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (config, warnings) = EngineConfig::from_env().context("load configuration")?;
    for warning in &warnings {
        warn!(target: "upw.daemon", "{warning}");
    }

    let database_url = args.database.unwrap_or_else(|| config.database_url.clone());
    let bind = args
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.host, config.port));

    let store = Arc::new(
        SqliteStore::connect(&database_url, config.results_retention)
            .await
            .with_context(|| format!("open store at {database_url}"))?,
    );
    let registry = Arc::new(StageRegistry::with_builtin_stages());
    let engine = Arc::new(Engine::new(registry, store.clone()));

    let scheduler = Scheduler::start(
        engine.clone(),
        store.clone(),
        SchedulerConfig {
            max_concurrent_checks: config.max_concurrent_checks,
            ..SchedulerConfig::default()
        },
    )
    .await
    .context("start scheduler")?;

    let state = Arc::new(AppState {
        engine,
        store,
        scheduler: scheduler.clone(),
        max_concurrent_checks: config.max_concurrent_checks,
    });

    let mut app = build_app(state);
    if let Some(cors) = cors_layer(&config.cors_origins) {
        app = app.layer(cors);
    }

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(
        target: "upw.daemon",
        bind = %bind,
        database = %database_url,
        "upw-daemon listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    info!(target: "upw.daemon", "shutting down scheduler");
    scheduler.shutdown().await;
    Ok(())
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return Some(layer.allow_origin(Any));
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(target: "upw.daemon", origin = %origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    Some(layer.allow_origin(AllowOrigin::list(parsed)))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!(target: "upw.daemon", "ctrl-c handler unavailable, running until killed");
        std::future::pending::<()>().await;
    }
}
