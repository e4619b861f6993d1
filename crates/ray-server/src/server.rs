use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use ray_engine::TurnOrchestrator;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 9091 }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TurnOrchestrator>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ray-response", post(ray_response_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the webhook server. Returns a handle that keeps the
/// serve task alive.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<TurnOrchestrator>,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(AppState { orchestrator });
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), "Ray webhook server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
    })
}

pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

/// Health check HTTP endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Turn pushed asynchronously by the remote agent. Acks right away; a
/// command batch can run for minutes and the agent's delivery must not
/// hang on it.
async fn ray_response_handler(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        if let Err(e) = orchestrator.ingest_payload(&payload).await {
            warn!(error = %e, "webhook payload processing failed");
        }
    });
    Json(json!({"status": "ok"}))
}
