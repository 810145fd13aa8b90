//! Mailtide Campaigns Service
//!
//! Polls every workspace for due or in-flight broadcasts and drives each
//! one through an orchestrator run. Orchestrator runs are idempotent and
//! resume from the persisted status and cursor, so the scheduler simply
//! re-enters on every tick; timed waits (A/B test windows) fall out of the
//! same loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Json, Router};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use mailtide_database::{BroadcastsRepository, WorkspaceRegistry};
use mailtide_utils::{config::AppConfig, logging::init_logging};

use mailtide_campaigns::orchestrator::BroadcastOrchestrator;

const SCHEDULER_TICK: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().unwrap_or_default();
    init_logging(&config.logging)?;
    info!("Starting Mailtide Campaigns Service");

    let registry = Arc::new(
        WorkspaceRegistry::connect(
            config.database.clone(),
            config.security.master_passphrase.clone(),
        )
        .await?,
    );

    let running: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    tokio::spawn(scheduler_loop(registry.clone(), config.clone(), running));

    let app = Router::new()
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Campaigns Service listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn scheduler_loop(
    registry: Arc<WorkspaceRegistry>,
    config: AppConfig,
    running: Arc<Mutex<HashSet<String>>>,
) {
    loop {
        if let Err(e) = tick(&registry, &config, &running).await {
            error!(error = %e, "scheduler tick failed");
        }
        tokio::time::sleep(SCHEDULER_TICK).await;
    }
}

async fn tick(
    registry: &Arc<WorkspaceRegistry>,
    config: &AppConfig,
    running: &Arc<Mutex<HashSet<String>>>,
) -> Result<()> {
    for workspace_id in registry.workspace_ids().await? {
        let pool = registry.workspace_pool(&workspace_id).await?;
        let broadcasts = BroadcastsRepository::new(pool.clone());

        for broadcast in broadcasts.find_runnable(Utc::now()).await? {
            let key = format!("{workspace_id}/{}", broadcast.id);
            {
                let mut guard = running.lock().await;
                if !guard.insert(key.clone()) {
                    continue;
                }
            }

            let workspace = registry.load_workspace(&workspace_id).await?;
            let orchestrator = BroadcastOrchestrator::new(
                workspace,
                pool.clone(),
                config.tracking.clone(),
                config.delivery.clone(),
            )?;
            let running = running.clone();
            let broadcast_id = broadcast.id.clone();
            let repo = BroadcastsRepository::new(pool.clone());

            tokio::spawn(async move {
                if let Err(e) = orchestrator.run(&broadcast_id).await {
                    error!(broadcast_id, error = %e, "broadcast orchestration failed");
                    // The orchestrator itself cannot progress; per-recipient
                    // failures never end up here.
                    if let Err(e) = repo
                        .transition(&broadcast_id, mailtide_models::BroadcastStatus::Failed)
                        .await
                    {
                        error!(broadcast_id, error = %e, "failed to mark broadcast failed");
                    }
                }
                running.lock().await.remove(&key);
            });
        }
    }
    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "campaigns",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
