use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::StoreError;
use crate::time::parse_utc;
use crate::types::{
    AttemptErrorKind, ContentType, DeliveryAttemptLog, DeliveryOutcome, DeliveryStatus,
    HttpMethod, Webhook, WebhookDelivery, WebhookStatus,
};

pub(super) const DELIVERY_COLUMNS: &str = "id, webhook_id, workspace_id, event, payload, status, \
     attempt_count, max_attempts, http_status_code, response_body, response_headers, \
     error_message, duration_ms, next_retry_at, delivered_at, metadata, created_at, updated_at";

pub(super) const WEBHOOK_COLUMNS: &str = "id, workspace_id, user_id, url, secret, status, events, \
     http_method, content_type, timeout_ms, max_retries, retry_delay_ms, headers, \
     signature_header, signature_algorithm, success_count, failure_count, last_delivery_at, \
     last_delivery_status, last_error, created_at, updated_at";

pub(super) const ATTEMPT_COLUMNS: &str = "id, delivery_id, webhook_id, attempt_no, started_at, \
     finished_at, success, http_status_code, response_body, error_kind, error_message, duration_ms";

#[derive(sqlx::FromRow)]
pub(super) struct DeliveryRow {
    id: String,
    webhook_id: String,
    workspace_id: String,
    event: String,
    payload: String,
    status: String,
    attempt_count: i64,
    max_attempts: i64,
    http_status_code: Option<i64>,
    response_body: Option<String>,
    response_headers: Option<String>,
    error_message: Option<String>,
    duration_ms: Option<i64>,
    next_retry_at: Option<String>,
    delivered_at: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<DeliveryRow> for WebhookDelivery {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let response_headers = match row.response_headers.as_deref() {
            Some(raw) => Some(
                serde_json::from_str::<BTreeMap<String, String>>(raw).map_err(|err| {
                    StoreError::Parse(format!("invalid response headers JSON: {err}"))
                })?,
            ),
            None => None,
        };
        let metadata: BTreeMap<String, String> = serde_json::from_str(&row.metadata)
            .map_err(|err| StoreError::Parse(format!("invalid metadata JSON: {err}")))?;

        Ok(Self {
            id: parse_uuid("delivery id", &row.id)?,
            webhook_id: parse_uuid("webhook id", &row.webhook_id)?,
            workspace_id: parse_uuid("workspace id", &row.workspace_id)?,
            event: row.event,
            payload: row.payload,
            status: parse_delivery_status(&row.status)?,
            attempt_count: to_u32("attempt_count", row.attempt_count)?,
            max_attempts: to_u32("max_attempts", row.max_attempts)?,
            http_status_code: row
                .http_status_code
                .map(to_status_code)
                .transpose()?,
            response_body: row.response_body,
            response_headers,
            error_message: row.error_message,
            duration_ms: row.duration_ms.map(|ms| ms.max(0) as u64),
            next_retry_at: parse_opt_time("next_retry_at", row.next_retry_at.as_deref())?,
            delivered_at: parse_opt_time("delivered_at", row.delivered_at.as_deref())?,
            metadata,
            created_at: parse_time("created_at", &row.created_at)?,
            updated_at: parse_time("updated_at", &row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct WebhookRow {
    id: String,
    workspace_id: String,
    user_id: String,
    url: String,
    secret: Option<String>,
    status: String,
    events: String,
    http_method: String,
    content_type: String,
    timeout_ms: i64,
    max_retries: i64,
    retry_delay_ms: i64,
    headers: String,
    signature_header: Option<String>,
    signature_algorithm: Option<String>,
    success_count: i64,
    failure_count: i64,
    last_delivery_at: Option<String>,
    last_delivery_status: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<WebhookRow> for Webhook {
    type Error = StoreError;

    fn try_from(row: WebhookRow) -> Result<Self, Self::Error> {
        let events: BTreeSet<String> = serde_json::from_str(&row.events)
            .map_err(|err| StoreError::Parse(format!("invalid events JSON: {err}")))?;
        let headers: BTreeMap<String, String> = serde_json::from_str(&row.headers)
            .map_err(|err| StoreError::Parse(format!("invalid headers JSON: {err}")))?;

        Ok(Self {
            id: parse_uuid("webhook id", &row.id)?,
            workspace_id: parse_uuid("workspace id", &row.workspace_id)?,
            user_id: parse_uuid("user id", &row.user_id)?,
            url: row.url,
            secret: row.secret,
            status: parse_webhook_status(&row.status)?,
            events,
            http_method: parse_http_method(&row.http_method)?,
            content_type: parse_content_type(&row.content_type)?,
            timeout_ms: to_u64("timeout_ms", row.timeout_ms)?,
            max_retries: to_u32("max_retries", row.max_retries)?,
            retry_delay_ms: to_u64("retry_delay_ms", row.retry_delay_ms)?,
            headers,
            signature_header: row.signature_header,
            signature_algorithm: row.signature_algorithm,
            success_count: row.success_count.max(0) as u64,
            failure_count: row.failure_count.max(0) as u64,
            last_delivery_at: parse_opt_time("last_delivery_at", row.last_delivery_at.as_deref())?,
            last_delivery_status: row
                .last_delivery_status
                .as_deref()
                .map(parse_outcome)
                .transpose()?,
            last_error: row.last_error,
            created_at: parse_time("created_at", &row.created_at)?,
            updated_at: parse_time("updated_at", &row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct AttemptRow {
    id: String,
    delivery_id: String,
    webhook_id: String,
    attempt_no: i64,
    started_at: String,
    finished_at: String,
    success: bool,
    http_status_code: Option<i64>,
    response_body: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    duration_ms: i64,
}

impl TryFrom<AttemptRow> for DeliveryAttemptLog {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid("attempt id", &row.id)?,
            delivery_id: parse_uuid("delivery id", &row.delivery_id)?,
            webhook_id: parse_uuid("webhook id", &row.webhook_id)?,
            attempt_no: to_u32("attempt_no", row.attempt_no)?,
            started_at: parse_time("started_at", &row.started_at)?,
            finished_at: parse_time("finished_at", &row.finished_at)?,
            success: row.success,
            http_status_code: row
                .http_status_code
                .map(to_status_code)
                .transpose()?,
            response_body: row.response_body,
            error_kind: row.error_kind.as_deref().map(parse_error_kind).transpose()?,
            error_message: row.error_message,
            duration_ms: row.duration_ms.max(0) as u64,
        })
    }
}

pub(super) fn parse_uuid(field: &str, value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|err| StoreError::Parse(format!("invalid {field}: {err}")))
}

pub(super) fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    parse_utc(value).map_err(|err| StoreError::Parse(format!("invalid {field}: {err}")))
}

fn parse_opt_time(field: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|value| parse_time(field, value)).transpose()
}

fn to_u32(field: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Parse(format!("{field} out of range: {value}")))
}

fn to_u64(field: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Parse(format!("{field} out of range: {value}")))
}

/// Column value for an unsigned setting; SQLite integers stop at `i64::MAX`.
pub(super) fn to_i64(field: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Parse(format!("{field} out of range: {value}")))
}

pub(super) fn parse_ids(ids: &[String]) -> Result<Vec<Uuid>, StoreError> {
    ids.iter().map(|id| parse_uuid("delivery id", id)).collect()
}

pub(super) fn to_status_code(value: i64) -> Result<u16, StoreError> {
    u16::try_from(value)
        .map_err(|_| StoreError::Parse(format!("http status out of range: {value}")))
}

pub(super) fn parse_delivery_status(status: &str) -> Result<DeliveryStatus, StoreError> {
    match status {
        "pending" => Ok(DeliveryStatus::Pending),
        "delivered" => Ok(DeliveryStatus::Delivered),
        "failed" => Ok(DeliveryStatus::Failed),
        other => Err(StoreError::Parse(format!("unknown delivery status: {other}"))),
    }
}

pub(super) fn delivery_status_to_str(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "pending",
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::Failed => "failed",
    }
}

fn parse_webhook_status(status: &str) -> Result<WebhookStatus, StoreError> {
    match status {
        "active" => Ok(WebhookStatus::Active),
        "paused" => Ok(WebhookStatus::Paused),
        "disabled" => Ok(WebhookStatus::Disabled),
        other => Err(StoreError::Parse(format!("unknown webhook status: {other}"))),
    }
}

pub(super) fn webhook_status_to_str(status: WebhookStatus) -> &'static str {
    match status {
        WebhookStatus::Active => "active",
        WebhookStatus::Paused => "paused",
        WebhookStatus::Disabled => "disabled",
    }
}

fn parse_http_method(method: &str) -> Result<HttpMethod, StoreError> {
    match method {
        "POST" => Ok(HttpMethod::Post),
        "PUT" => Ok(HttpMethod::Put),
        "PATCH" => Ok(HttpMethod::Patch),
        other => Err(StoreError::Parse(format!("unknown http method: {other}"))),
    }
}

pub(super) fn http_method_to_str(method: HttpMethod) -> &'static str {
    match method {
        HttpMethod::Post => "POST",
        HttpMethod::Put => "PUT",
        HttpMethod::Patch => "PATCH",
    }
}

fn parse_content_type(content_type: &str) -> Result<ContentType, StoreError> {
    match content_type {
        "application/json" => Ok(ContentType::Json),
        "application/x-www-form-urlencoded" => Ok(ContentType::FormUrlEncoded),
        other => Err(StoreError::Parse(format!("unknown content type: {other}"))),
    }
}

pub(super) fn content_type_to_str(content_type: ContentType) -> &'static str {
    match content_type {
        ContentType::Json => "application/json",
        ContentType::FormUrlEncoded => "application/x-www-form-urlencoded",
    }
}

fn parse_outcome(outcome: &str) -> Result<DeliveryOutcome, StoreError> {
    match outcome {
        "success" => Ok(DeliveryOutcome::Success),
        "failure" => Ok(DeliveryOutcome::Failure),
        other => Err(StoreError::Parse(format!("unknown delivery outcome: {other}"))),
    }
}

pub(super) fn outcome_to_str(outcome: DeliveryOutcome) -> &'static str {
    match outcome {
        DeliveryOutcome::Success => "success",
        DeliveryOutcome::Failure => "failure",
    }
}

fn parse_error_kind(kind: &str) -> Result<AttemptErrorKind, StoreError> {
    match kind {
        "timeout" => Ok(AttemptErrorKind::Timeout),
        "network" => Ok(AttemptErrorKind::Network),
        "http_status" => Ok(AttemptErrorKind::HttpStatus),
        "circuit_open" => Ok(AttemptErrorKind::CircuitOpen),
        "unexpected" => Ok(AttemptErrorKind::Unexpected),
        other => Err(StoreError::Parse(format!("unknown error kind: {other}"))),
    }
}

pub(super) fn error_kind_to_str(kind: AttemptErrorKind) -> &'static str {
    match kind {
        AttemptErrorKind::Timeout => "timeout",
        AttemptErrorKind::Network => "network",
        AttemptErrorKind::HttpStatus => "http_status",
        AttemptErrorKind::CircuitOpen => "circuit_open",
        AttemptErrorKind::Unexpected => "unexpected",
    }
}

pub(super) fn to_json<T: serde::Serialize>(field: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|err| StoreError::Parse(format!("cannot encode {field}: {err}")))
}
