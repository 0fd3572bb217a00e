//! HTTP admin API for leader elections
//!
//! - `GET  /health`
//! - `GET  /maintain/v1/leaders`
//! - `GET  /maintain/v1/leaders/:key`
//! - `POST /maintain/v1/leaders/:key/release`
//! - `GET  /metrics`

use crate::common::{Error, MetricsRegistry};
use crate::election::{ElectionCoordinator, ElectionRecord};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AdminState {
    pub coordinator: Arc<ElectionCoordinator>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Election row plus whether this process is the one leading it
#[derive(Debug, Serialize)]
struct LeaderView {
    #[serde(flatten)]
    record: ElectionRecord,
    is_local_leader: bool,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (
            self.to_http_status(),
            Json(json!({ "error": self.to_string(), "code": self.code() })),
        )
            .into_response()
    }
}

pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/maintain/v1/leaders", get(list_leaders))
        .route("/maintain/v1/leaders/:key", get(get_leader))
        .route("/maintain/v1/leaders/:key/release", post(release_leader))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "host": state.coordinator.host(),
        "elections": state.coordinator.running_elections().len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.to_prometheus())
}

async fn list_leaders(State(state): State<AdminState>) -> Result<impl IntoResponse, Error> {
    let coordinator = &state.coordinator;
    let records = coordinator.list_leader_elections().await?;
    let views: Vec<LeaderView> = records
        .into_iter()
        .map(|record| LeaderView {
            is_local_leader: coordinator.is_leader(&record.key),
            record,
        })
        .collect();
    Ok(Json(views))
}

async fn get_leader(
    State(state): State<AdminState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let snapshot = state
        .coordinator
        .snapshot(&key)
        .ok_or_else(|| Error::NotStarted(key.clone()))?;
    Ok(Json(json!({
        "key": snapshot.key,
        "is_leader": snapshot.is_leader,
        "leader": snapshot.leader,
        "version": snapshot.version,
        "release_tick_limit": snapshot.release_tick_limit,
    })))
}

async fn release_leader(
    State(state): State<AdminState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.coordinator.release_leader_election(&key)?;
    Ok(Json(json!({ "status": "release requested", "key": key })))
}
