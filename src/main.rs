use anyhow::Result;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reviewd::config::Config;
use reviewd::github::GithubClient;
use reviewd::openai::OpenAiClient;
use reviewd::queue::{worker_loop, JobQueue};
use reviewd::registrar::repository_router;
use reviewd::stats::stats_handler;
use reviewd::webhook::webhook_router;
use reviewd::{AppState, Store};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "reviewd"
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting reviewd");

    let config = Config::from_env()?;

    let db_path = config.state_dir.join("reviewd.db");
    info!("Using state database: {}", db_path.display());
    let store = Store::open(&db_path).await?;

    // Jobs left running by a crashed instance go back to the queue before
    // workers start.
    let reset = store.reset_running_jobs().await?;
    if reset > 0 {
        info!("Requeued {} jobs interrupted by the previous run", reset);
    }

    let provider = GithubClient::new(Duration::from_secs(config.request_timeout_secs));
    let backend = OpenAiClient::new(
        config.openai_api_key.clone(),
        config.openai_model.clone(),
        Duration::from_secs(config.request_timeout_secs),
    );

    let queue = JobQueue::new(store.clone());
    let app_state = Arc::new(AppState {
        provider: Arc::new(provider),
        backend: Arc::new(backend),
        store,
        queue,
        config,
    });

    for worker_id in 0..app_state.config.worker_count {
        let worker_state = app_state.clone();
        tokio::spawn(async move {
            worker_loop(worker_state, worker_id).await;
        });
    }

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats_handler))
        .merge(repository_router())
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state.clone());

    let listener = TcpListener::bind(format!("0.0.0.0:{}", app_state.config.port)).await?;
    info!("Server listening on port {}", app_state.config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
