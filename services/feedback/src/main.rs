//! Mailtide Feedback Service
//!
//! Ingests everything the outside world says about delivered mail:
//! provider webhooks, DSN/ARF reports fetched from IMAP bounce mailboxes,
//! tracking-endpoint hits and notification-center actions. All paths
//! normalize into canonical engagement events applied by the recorder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use mailtide_database::{EngagementRecorder, WorkspaceRegistry};
use mailtide_utils::{config::AppConfig, logging::init_logging};

mod arf;
mod dsn;
mod heuristic;
mod ingest;
mod poller;

use ingest::{IngestService, TRACKING_PIXEL};
use poller::BouncePoller;

#[derive(Clone)]
struct AppState {
    ingest: Arc<IngestService>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().unwrap_or_default();
    init_logging(&config.logging)?;
    info!("Starting Mailtide Feedback Service");

    let registry = Arc::new(
        WorkspaceRegistry::connect(
            config.database.clone(),
            config.security.master_passphrase.clone(),
        )
        .await?,
    );

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_bounce_pollers(&registry, &config, shutdown_rx).await?;

    let state = AppState {
        ingest: Arc::new(IngestService::new(registry)),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/:workspace_id/:integration_id", post(receive_webhook))
        .route("/visit", get(visit))
        .route("/opens", get(opens))
        .route("/notification-center", get(notification_center))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Feedback Service listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// One poller per SMTP integration with a bounce mailbox.
async fn spawn_bounce_pollers(
    registry: &Arc<WorkspaceRegistry>,
    config: &AppConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let interval = Duration::from_secs(config.bounce_polling.interval_seconds);

    for workspace_id in registry.workspace_ids().await? {
        let workspace = match registry.load_workspace(&workspace_id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(workspace_id, error = %e, "skipping workspace for bounce polling");
                continue;
            }
        };
        let Some(secret_key) = workspace.settings.secret_key.clone() else {
            continue;
        };
        let pool = registry.workspace_pool(&workspace_id).await?;
        let recorder = Arc::new(EngagementRecorder::new(pool, secret_key));

        for integration in &workspace.integrations {
            let Some(email) = &integration.email else {
                continue;
            };
            let Some(smtp) = &email.smtp else {
                continue;
            };
            if smtp.bounce_mailbox.is_none() {
                continue;
            }

            let poller = BouncePoller::new(
                workspace_id.clone(),
                integration.id.clone(),
                smtp.clone(),
                recorder.clone(),
                interval,
            );
            tokio::spawn(poller.run(shutdown.clone()));
        }
    }

    Ok(())
}

async fn receive_webhook(
    State(state): State<AppState>,
    Path((workspace_id, integration_id)): Path<(String, String)>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let applied = state
        .ingest
        .handle_webhook(&workspace_id, &integration_id, payload)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    Ok(Json(serde_json::json!({"events_recorded": applied})))
}

async fn visit(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (Some(mid), Some(wid), Some(url)) =
        (params.get("mid"), params.get("wid"), params.get("url"))
    else {
        return (StatusCode::BAD_REQUEST, "missing parameters").into_response();
    };

    match state.ingest.handle_visit(wid, mid, url).await {
        Ok(target) => Redirect::temporary(&target).into_response(),
        Err(e) => {
            error!(error = %e, "visit tracking failed");
            // Never strand the reader: redirect even when recording broke.
            Redirect::temporary(url).into_response()
        }
    }
}

async fn opens(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let (Some(mid), Some(wid)) = (params.get("mid"), params.get("wid")) {
        if let Err(e) = state.ingest.handle_open(wid, mid).await {
            error!(error = %e, "open tracking failed");
        }
    }

    ([(header::CONTENT_TYPE, "image/gif")], TRACKING_PIXEL).into_response()
}

async fn notification_center(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (Some(action), Some(email), Some(email_hmac), Some(wid)) = (
        params.get("action"),
        params.get("email"),
        params.get("email_hmac"),
        params.get("wid"),
    ) else {
        return (StatusCode::BAD_REQUEST, "missing parameters").into_response();
    };

    let outcome = match action.as_str() {
        "unsubscribe" => {
            // Transactional unsubscribe links are workspace-scoped and
            // carry an empty lid: that means every list.
            let list_id = params
                .get("lid")
                .map(String::as_str)
                .filter(|lid| !lid.is_empty());
            state
                .ingest
                .handle_unsubscribe(
                    wid,
                    email,
                    email_hmac,
                    list_id,
                    params.get("mid").map(String::as_str),
                )
                .await
        }
        "confirm" => {
            let Some(lid) = params.get("lid") else {
                return (StatusCode::BAD_REQUEST, "missing lid").into_response();
            };
            state.ingest.handle_confirm(wid, email, email_hmac, lid).await
        }
        _ => return (StatusCode::BAD_REQUEST, "unknown action").into_response(),
    };

    match outcome {
        Ok(true) => Json(serde_json::json!({"status": "ok"})).into_response(),
        // A dropped event (HMAC mismatch) answers 403 without mutating
        // anything.
        Ok(false) => (StatusCode::FORBIDDEN, "request not verified").into_response(),
        Err(e) => {
            error!(error = %e, "notification center action failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "feedback",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
