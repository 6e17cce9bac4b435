use axum::{Json, extract::State};
use tracing::info;

use crate::{
    error::ApiError,
    extractors::ValidPath,
    state::AppState,
    types::{CircuitBreakerStats, ListCircuitsResponse},
};

pub async fn list_circuits_handler(State(state): State<AppState>) -> Json<ListCircuitsResponse> {
    Json(ListCircuitsResponse {
        circuits: state.dispatcher.registry().stats_all(),
    })
}

pub async fn open_circuit_handler(
    State(state): State<AppState>,
    ValidPath(key): ValidPath<String>,
) -> Json<CircuitBreakerStats> {
    info!(key = %key, "circuit forced open");
    Json(state.dispatcher.registry().force_open(&key))
}

pub async fn close_circuit_handler(
    State(state): State<AppState>,
    ValidPath(key): ValidPath<String>,
) -> Result<Json<CircuitBreakerStats>, ApiError> {
    let stats = state
        .dispatcher
        .registry()
        .force_close(&key)
        .ok_or_else(|| ApiError::not_found("circuit not found"))?;
    info!(key = %key, "circuit forced closed");
    Ok(Json(stats))
}

pub async fn reset_circuit_handler(
    State(state): State<AppState>,
    ValidPath(key): ValidPath<String>,
) -> Result<Json<CircuitBreakerStats>, ApiError> {
    let stats = state
        .dispatcher
        .registry()
        .reset(&key)
        .ok_or_else(|| ApiError::not_found("circuit not found"))?;
    info!(key = %key, "circuit reset");
    Ok(Json(stats))
}
