use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{
    delivery::DEFAULT_MAX_DELAY,
    dispatcher::DispatcherConfig,
    error::ApiError,
    extractors::{ValidJson, ValidPath},
    state::AppState,
    types::{
        CreateWebhookRequest, HealthMetrics, UpdateWebhookStatusRequest,
        UpdateWebhookStatusResponse, Webhook, WebhookResponse,
    },
};

/// The backoff cap; a larger base delay would only ever wait the cap.
const MAX_RETRY_DELAY_MS: u64 = DEFAULT_MAX_DELAY.as_secs() * 1_000;

#[derive(Debug, Serialize)]
pub struct DeleteWebhookResponse {
    webhook_id: Uuid,
    cancelled_deliveries: u64,
}

pub async fn create_webhook_handler(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<CreateWebhookRequest>,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    validate_create_request(&req, state.dispatcher.config())?;

    let webhook = Webhook::register(req, state.dispatcher.clock().now());
    state.dispatcher.webhooks().insert_webhook(&webhook).await?;
    info!(webhook_id = %webhook.id, workspace_id = %webhook.workspace_id, "webhook registered");

    Ok((StatusCode::CREATED, Json(webhook.into())))
}

pub async fn get_webhook_handler(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> Result<Json<WebhookResponse>, ApiError> {
    state
        .dispatcher
        .webhooks()
        .get_webhook(id)
        .await?
        .map(|webhook| Json(webhook.into()))
        .ok_or_else(|| ApiError::not_found("webhook not found"))
}

pub async fn health_handler(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> Result<Json<HealthMetrics>, ApiError> {
    Ok(Json(state.dispatcher.health_metrics(id).await?))
}

/// Anything but `active` also cancels the webhook's pending deliveries.
pub async fn update_status_handler(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
    ValidJson(req): ValidJson<UpdateWebhookStatusRequest>,
) -> Result<Json<UpdateWebhookStatusResponse>, ApiError> {
    let cancelled_deliveries = state
        .dispatcher
        .set_webhook_status(id, req.status)
        .await?;
    info!(
        webhook_id = %id,
        status = ?req.status,
        cancelled_deliveries,
        "webhook status changed"
    );

    Ok(Json(UpdateWebhookStatusResponse {
        webhook_id: id,
        status: req.status,
        cancelled_deliveries,
    }))
}

pub async fn delete_webhook_handler(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<Uuid>,
) -> Result<Json<DeleteWebhookResponse>, ApiError> {
    let cancelled_deliveries = state.dispatcher.delete_webhook(id).await?;
    info!(webhook_id = %id, cancelled_deliveries, "webhook deleted");

    Ok(Json(DeleteWebhookResponse {
        webhook_id: id,
        cancelled_deliveries,
    }))
}

fn validate_create_request(
    req: &CreateWebhookRequest,
    config: &DispatcherConfig,
) -> Result<(), ApiError> {
    let url = reqwest::Url::parse(&req.url).map_err(|_| ApiError::validation("url is invalid"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::validation("url must be http or https"));
    }
    if req.events.iter().any(|event| event.trim().is_empty()) {
        return Err(ApiError::validation("events must be non-empty"));
    }
    if let Some(timeout_ms) = req.timeout_ms {
        let max_ms = u64::try_from(config.max_attempt_timeout().as_millis()).unwrap_or(u64::MAX);
        if timeout_ms == 0 || timeout_ms > max_ms {
            return Err(ApiError::validation(format!(
                "timeout_ms must be between 1 and {max_ms}"
            )));
        }
    }
    if req.max_retries == Some(0) {
        return Err(ApiError::validation("max_retries must be > 0"));
    }
    if let Some(retry_delay_ms) = req.retry_delay_ms
        && retry_delay_ms > MAX_RETRY_DELAY_MS
    {
        return Err(ApiError::validation(format!(
            "retry_delay_ms must be at most {MAX_RETRY_DELAY_MS}"
        )));
    }
    Ok(())
}
