use axum::{Json, extract::State};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    extractors::{ValidPath, ValidQuery},
    state::AppState,
    store::{DeliveryCursor, ListDeliveriesParams},
    time::{format_utc, parse_utc},
    types::{DeliveryStatus, ListAttemptsResponse, ListDeliveriesResponse, WebhookDelivery},
};

#[derive(Debug, Deserialize)]
pub struct ListDeliveriesQuery {
    limit: Option<i64>,
    before: Option<String>,
    status: Option<String>,
    webhook_id: Option<Uuid>,
    workspace_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    created_at: String,
    id: String,
}

pub async fn list_deliveries_handler(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<ListDeliveriesQuery>,
) -> Result<Json<ListDeliveriesResponse>, ApiError> {
    let limit = parse_limit(query.limit)?;
    let before = query.before.as_deref().map(decode_cursor).transpose()?;
    let status = query.status.as_deref().map(parse_status).transpose()?;

    let params = ListDeliveriesParams {
        limit,
        before,
        status,
        webhook_id: query.webhook_id,
        workspace_id: query.workspace_id,
    };

    let result = state.dispatcher.deliveries().list(&params).await?;
    let next_before = result.next_before.as_ref().map(encode_cursor).transpose()?;

    Ok(Json(ListDeliveriesResponse {
        deliveries: result.deliveries,
        next_before,
    }))
}

pub async fn get_delivery_handler(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> Result<Json<WebhookDelivery>, ApiError> {
    Ok(Json(load_delivery(&state, id).await?))
}

pub async fn list_attempts_handler(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> Result<Json<ListAttemptsResponse>, ApiError> {
    load_delivery(&state, id).await?;
    let attempts = state.dispatcher.deliveries().list_attempts(id).await?;
    Ok(Json(ListAttemptsResponse { attempts }))
}

/// Makes a pending or failed delivery due now, keeping its attempt budget.
pub async fn retry_delivery_handler(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> Result<Json<WebhookDelivery>, ApiError> {
    let mut delivery = load_delivery(&state, id).await?;
    let (expected_status, expected_attempts) = (delivery.status, delivery.attempt_count);

    let events = delivery.schedule_retry(state.dispatcher.clock().now())?;
    state
        .dispatcher
        .deliveries()
        .save(&delivery, expected_status, expected_attempts, None)
        .await?;
    state.dispatcher.events().publish(events);

    Ok(Json(delivery))
}

pub async fn cancel_delivery_handler(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> Result<Json<WebhookDelivery>, ApiError> {
    let mut delivery = load_delivery(&state, id).await?;
    let (expected_status, expected_attempts) = (delivery.status, delivery.attempt_count);

    let events = delivery.cancel(state.dispatcher.clock().now())?;
    state
        .dispatcher
        .deliveries()
        .save(&delivery, expected_status, expected_attempts, None)
        .await?;
    state.dispatcher.events().publish(events);

    Ok(Json(delivery))
}

async fn load_delivery(state: &AppState, id: Uuid) -> Result<WebhookDelivery, ApiError> {
    state
        .dispatcher
        .deliveries()
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found("delivery not found"))
}

fn parse_limit(limit: Option<i64>) -> Result<i64, ApiError> {
    let limit = limit.unwrap_or(50);
    if !(1..=200).contains(&limit) {
        return Err(ApiError::validation("limit must be between 1 and 200"));
    }
    Ok(limit)
}

fn parse_status(value: &str) -> Result<DeliveryStatus, ApiError> {
    match value {
        "pending" => Ok(DeliveryStatus::Pending),
        "delivered" => Ok(DeliveryStatus::Delivered),
        "failed" => Ok(DeliveryStatus::Failed),
        _ => Err(ApiError::validation("status is invalid")),
    }
}

fn decode_cursor(raw: &str) -> Result<DeliveryCursor, ApiError> {
    let invalid = || ApiError::validation("before must be a valid cursor");
    let decoded = URL_SAFE_NO_PAD.decode(raw).map_err(|_| invalid())?;
    let payload: CursorPayload = serde_json::from_slice(&decoded).map_err(|_| invalid())?;
    Ok(DeliveryCursor {
        created_at: parse_utc(&payload.created_at).map_err(|_| invalid())?,
        id: Uuid::parse_str(&payload.id).map_err(|_| invalid())?,
    })
}

fn encode_cursor(cursor: &DeliveryCursor) -> Result<String, ApiError> {
    let payload = CursorPayload {
        created_at: format_utc(cursor.created_at),
        id: cursor.id.to_string(),
    };
    let encoded = serde_json::to_vec(&payload)
        .map_err(|_| ApiError::Internal("failed to encode cursor".to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(encoded))
}
