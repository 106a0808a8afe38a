//! HTTP introspection endpoints
//!
//! `GET /health` — aggregate + per-service status
//! `GET /health/details` (alias `/health/detailed`) — full detail maps
//! `GET /health/service?name=X` — one service's record

use crate::health::HealthRegistry;
use crate::shutdown::ShutdownToken;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

pub fn health_router(health: Arc<HealthRegistry>) -> Router {
    Router::new()
        .route("/health", get(overall))
        .route("/health/details", get(details))
        .route("/health/detailed", get(details))
        .route("/health/service", get(one_service))
        .with_state(health)
}

async fn overall(State(health): State<Arc<HealthRegistry>>) -> impl IntoResponse {
    Json(health.to_json(false))
}

async fn details(State(health): State<Arc<HealthRegistry>>) -> impl IntoResponse {
    Json(health.to_json(true))
}

#[derive(Debug, Deserialize)]
struct ServiceQuery {
    name: String,
}

async fn one_service(
    State(health): State<Arc<HealthRegistry>>,
    Query(query): Query<ServiceQuery>,
) -> impl IntoResponse {
    match health.record(&query.name) {
        Some(record) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "name": query.name,
                "status": record.status,
                "lastChecked": record.last_checked_millis,
                "details": record.details,
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!("no health record for '{}'", query.name),
            })),
        ),
    }
}

/// Bind and serve the health endpoints until shutdown. Returns the bound
/// address (port 0 picks an ephemeral port).
pub async fn serve_health(
    health: Arc<HealthRegistry>,
    port: u16,
    shutdown: ShutdownToken,
) -> Result<SocketAddr, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    let app = health_router(health);

    tokio::spawn(async move {
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = server.await {
            tracing::error!(error = %e, "health endpoint failed");
        }
    });

    tracing::info!(%addr, "health endpoint listening");
    Ok(addr)
}
