use anyhow::{anyhow, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    api::traits::BufferSink,
    core::{logs::StationEvent, state::StationSnapshot, state::StateBoard},
};

/// Shared state for the status HTTP server
#[derive(Clone)]
pub struct StatusState {
    pub board: Arc<StateBoard>,
    pub events: BufferSink,
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    #[serde(default = "default_event_limit")]
    limit: usize,
    station: Option<String>,
}

fn default_event_limit() -> usize {
    100
}

async fn list_stations(State(state): State<StatusState>) -> Json<Vec<StationSnapshot>> {
    Json(state.board.all())
}

async fn get_station(
    State(state): State<StatusState>,
    Path(id): Path<String>,
) -> Result<Json<StationSnapshot>, (StatusCode, String)> {
    state
        .board
        .get(&id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown station '{id}'")))
}

async fn list_events(
    State(state): State<StatusState>,
    Query(query): Query<EventQuery>,
) -> Json<Vec<StationEvent>> {
    let buffer = state.events.buffer();
    let buffer = buffer.lock();
    let mut events = buffer
        .entries()
        .iter()
        .rev()
        .filter(|e| query.station.as_ref().is_none_or(|s| *s == e.station))
        .take(query.limit)
        .cloned()
        .collect::<Vec<_>>();
    events.reverse();
    Json(events)
}

/// Read-only JSON view of station snapshots and recent events.
pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/stations", get(list_stations))
        .route("/stations/{id}", get(get_station))
        .route("/events", get(list_events))
        .with_state(state)
}

/// Serve the status endpoint until `shutdown_rx` fires or disconnects.
pub async fn serve(listen: &str, state: StatusState, shutdown_rx: flume::Receiver<()>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| anyhow!("Failed to bind status server to {listen}: {e}"))?;
    log::info!("Status endpoint listening on {}", listener.local_addr()?);

    let shutdown_signal = async move {
        let _ = shutdown_rx.recv_async().await;
        log::info!("Status endpoint shutting down");
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| anyhow!("Status server error: {e}"))?;
    Ok(())
}
