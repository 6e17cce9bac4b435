use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError, extractors::ValidJson, state::AppState, types::EmitEventResponse,
};

#[derive(Debug, Deserialize)]
pub struct EmitEventRequest {
    workspace_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
}

pub async fn emit_event_handler(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<EmitEventRequest>,
) -> Result<(StatusCode, Json<EmitEventResponse>), ApiError> {
    let event_type = req.event_type.trim();
    if event_type.is_empty() {
        return Err(ApiError::validation("event_type is required"));
    }
    let payload = serde_json::to_string(&req.payload)
        .map_err(|err| ApiError::Internal(format!("failed to serialize payload: {err}")))?;

    let deliveries = state
        .dispatcher
        .emit(req.workspace_id, event_type, &payload)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EmitEventResponse {
            delivery_ids: deliveries.iter().map(|delivery| delivery.id).collect(),
        }),
    ))
}
