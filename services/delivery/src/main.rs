//! Mailtide Delivery Service
//!
//! Hosts the per-workspace send worker pools: claims queue rows, applies
//! per-integration rate limits, dispatches through the provider adapters
//! and records outcomes on the message history. Also runs the queue lease
//! recovery sweep and the transactional enqueue endpoint.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use mailtide_database::{
    BroadcastsRepository, EmailQueueRepository, MessageHistoryRepository, WorkspaceRegistry,
};
use mailtide_templates::engine::LiquidEngine;
use mailtide_utils::{config::AppConfig, logging::init_logging};

mod rate_limit;
mod transactional;
mod worker;

use rate_limit::RateLimiterRegistry;
use transactional::{TransactionalSend, TransactionalSender};
use worker::{recovery_loop, SendWorker, WorkspaceDelivery};

#[derive(Clone)]
struct AppState {
    sender: Arc<TransactionalSender>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().unwrap_or_default();
    init_logging(&config.logging)?;
    info!("Starting Mailtide Delivery Service");

    let registry = Arc::new(
        WorkspaceRegistry::connect(
            config.database.clone(),
            config.security.master_passphrase.clone(),
        )
        .await?,
    );
    let rate_limiters = Arc::new(RateLimiterRegistry::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for workspace_id in registry.workspace_ids().await? {
        if let Err(e) = spawn_workspace_workers(
            &workspace_id,
            registry.clone(),
            rate_limiters.clone(),
            &config,
            shutdown_rx.clone(),
        )
        .await
        {
            error!(workspace_id, error = %e, "failed to start workspace workers");
        }
    }

    let sender = Arc::new(TransactionalSender::new(
        registry.clone(),
        config.delivery.clone(),
        config.tracking.clone(),
    )?);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/internal/v1/:workspace_id/transactional", post(send_transactional))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { sender });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Delivery Service listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Signal workers to drain their claimed batches and stop.
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    Ok(())
}

async fn spawn_workspace_workers(
    workspace_id: &str,
    registry: Arc<WorkspaceRegistry>,
    rate_limiters: Arc<RateLimiterRegistry>,
    config: &AppConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let workspace = registry.load_workspace(workspace_id).await?;
    let pool = registry.workspace_pool(workspace_id).await?;

    let shared = Arc::new(WorkspaceDelivery {
        workspace,
        queue: EmailQueueRepository::new(pool.clone()),
        history: MessageHistoryRepository::new(pool.clone()),
        broadcasts: BroadcastsRepository::new(pool.clone()),
        registry,
        rate_limiters,
        config: config.delivery.clone(),
        engine: LiquidEngine::new()?,
    });

    let workers = config.delivery.clamped_workers();
    for index in 0..workers {
        let worker = SendWorker::new(index, shared.clone());
        tokio::spawn(worker.run(shutdown.clone()));
    }

    let queue = Arc::new(EmailQueueRepository::new(pool));
    tokio::spawn(recovery_loop(queue, config.delivery.clone(), shutdown));

    info!(workspace_id, workers, "workspace delivery started");
    Ok(())
}

/// Transactional send request, accepted from the API layer.
#[derive(Debug, Deserialize)]
struct SendRequest {
    contact_email: String,
    template_id: String,
    template_version: Option<i32>,
    integration_id: Option<String>,
    message_id: Option<String>,
    external_id: Option<String>,
    #[serde(default)]
    data: serde_json::Map<String, serde_json::Value>,
    reply_to: Option<String>,
    #[serde(default)]
    cc: Vec<String>,
    #[serde(default)]
    bcc: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SendResponse {
    message_id: String,
}

async fn send_transactional(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, (StatusCode, String)> {
    let send = TransactionalSend {
        contact_email: request.contact_email,
        template_id: request.template_id,
        template_version: request.template_version,
        integration_id: request.integration_id,
        message_id: request.message_id,
        external_id: request.external_id,
        data: request.data,
        reply_to: request.reply_to,
        cc: request.cc,
        bcc: request.bcc,
    };

    let message_id = state
        .sender
        .enqueue(&workspace_id, send)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    Ok(Json(SendResponse { message_id }))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "delivery",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
