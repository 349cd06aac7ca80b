//! Health & Status API endpoints
//!
//! - GET /health - Simple health check
//! - GET /metrics - Prometheus metrics
//! - GET /status - Record counts and watermarks per direction

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::db::SharedStore;
use crate::metrics;
use crate::ops::{self, DirectionStatus};
use crate::types::Direction;

#[derive(Clone)]
pub struct ApiState {
    store: SharedStore,
    /// Source chain id per direction, for watermark lookups
    directions: Arc<Vec<(Direction, u64)>>,
    started: Instant,
}

impl ApiState {
    pub fn new(store: SharedStore, directions: Vec<(Direction, u64)>) -> Self {
        Self {
            store,
            directions: Arc::new(directions),
            started: Instant::now(),
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: u64,
    directions: Vec<DirectionStatus>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .with_state(state)
}

/// Serve the API until `shutdown` flips to true
pub async fn start_api_server(
    addr: SocketAddr,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server started");
    metrics::UP.set(1.0);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    metrics::UP.set(0.0);
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn status(State(state): State<ApiState>) -> Response {
    let mut directions = Vec::with_capacity(state.directions.len());
    for (direction, chain_id) in state.directions.iter() {
        match ops::status(&state.store, *direction, *chain_id).await {
            Ok(summary) => directions.push(summary),
            Err(e) => {
                tracing::warn!(direction = %direction, error = %e, "Status query failed");
                return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
            }
        }
    }

    Json(StatusResponse {
        status: "ok",
        uptime_seconds: state.started.elapsed().as_secs(),
        directions,
    })
    .into_response()
}
