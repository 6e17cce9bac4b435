//! Outbound HTTP for delivery attempts.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration, time::Instant};

use reqwest::{Method, header::HeaderMap};
use thiserror::Error;
use tracing::{Instrument, info_span};

use crate::delivery::{DeliveryFailure, DeliveryResponse};
use crate::types::{AttemptErrorKind, ContentType, HttpMethod, Webhook, WebhookDelivery};

pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_ID_HEADER: &str = "X-Webhook-Delivery-Id";
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Webhook-Signature";

const MAX_RESPONSE_BODY_BYTES: usize = 64 * 1024;

/// Produces the signature header value for an outgoing body.
///
/// Signing schemes live outside this crate; a dispatcher without a signer
/// sends unsigned requests.
pub trait PayloadSigner: Send + Sync + fmt::Debug {
    fn sign(&self, webhook: &Webhook, body: &[u8]) -> Option<String>;
}

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, duration_ms: u64 },
    #[error("network error: {message}")]
    Network { message: String, duration_ms: u64 },
    #[error("HTTP {status_code}")]
    HttpStatus {
        status_code: u16,
        body: Option<String>,
        headers: BTreeMap<String, String>,
        duration_ms: u64,
    },
    #[error("cannot build request: {message}")]
    InvalidRequest { message: String },
}

impl AttemptError {
    pub fn kind(&self) -> AttemptErrorKind {
        match self {
            Self::Timeout { .. } => AttemptErrorKind::Timeout,
            Self::Network { .. } => AttemptErrorKind::Network,
            Self::HttpStatus { .. } => AttemptErrorKind::HttpStatus,
            Self::InvalidRequest { .. } => AttemptErrorKind::Unexpected,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            Self::Timeout { duration_ms, .. }
            | Self::Network { duration_ms, .. }
            | Self::HttpStatus { duration_ms, .. } => *duration_ms,
            Self::InvalidRequest { .. } => 0,
        }
    }

    pub fn into_failure(self) -> DeliveryFailure {
        let error_message = self.to_string();
        match self {
            Self::HttpStatus {
                status_code,
                body,
                headers,
                duration_ms,
            } => DeliveryFailure {
                error_message,
                http_status_code: Some(status_code),
                body,
                headers: Some(headers),
                duration_ms: Some(duration_ms),
            },
            Self::Timeout { duration_ms, .. } | Self::Network { duration_ms, .. } => {
                DeliveryFailure {
                    error_message,
                    duration_ms: Some(duration_ms),
                    ..DeliveryFailure::default()
                }
            }
            Self::InvalidRequest { .. } => DeliveryFailure::message(error_message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    signer: Option<Arc<dyn PayloadSigner>>,
}

impl DeliveryClient {
    pub fn new(user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;
        Ok(Self {
            client,
            signer: None,
        })
    }

    pub fn with_signer(mut self, signer: Arc<dyn PayloadSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Sends one attempt of `delivery` to `webhook`. Only 2xx is success.
    pub async fn deliver(
        &self,
        webhook: &Webhook,
        delivery: &WebhookDelivery,
        attempt_no: u32,
    ) -> Result<DeliveryResponse, AttemptError> {
        let span = info_span!(
            "webhook_attempt",
            delivery_id = %delivery.id,
            webhook_id = %webhook.id,
            attempt = attempt_no,
        );

        async move {
            let body = encode_body(webhook.content_type, &delivery.payload)?;
            let mut request = self
                .client
                .request(method(webhook.http_method), &webhook.url)
                .timeout(Duration::from_millis(webhook.timeout_ms.max(1)))
                .header("content-type", content_type(webhook.content_type));

            for (name, value) in &webhook.headers {
                if !is_managed_header(name) {
                    request = request.header(name.as_str(), value.as_str());
                }
            }

            request = request
                .header(EVENT_HEADER, delivery.event.as_str())
                .header(DELIVERY_ID_HEADER, delivery.id.to_string())
                .header(ATTEMPT_HEADER, attempt_no.to_string());

            if let Some(signer) = &self.signer
                && let Some(signature) = signer.sign(webhook, body.as_bytes())
            {
                let header = webhook
                    .signature_header
                    .as_deref()
                    .unwrap_or(DEFAULT_SIGNATURE_HEADER);
                request = request.header(header, signature);
            }

            let started = Instant::now();
            let response = match request.body(body).send().await {
                Ok(response) => response,
                Err(err) => {
                    let duration_ms = elapsed_ms(started);
                    tracing::debug!(duration_ms, error = %err, "request failed");
                    if err.is_timeout() {
                        return Err(AttemptError::Timeout {
                            timeout_ms: webhook.timeout_ms,
                            duration_ms,
                        });
                    }
                    if err.is_builder() {
                        return Err(AttemptError::InvalidRequest {
                            message: err.to_string(),
                        });
                    }
                    return Err(AttemptError::Network {
                        message: err.to_string(),
                        duration_ms,
                    });
                }
            };

            let status = response.status();
            let headers = extract_headers(response.headers());
            let body = read_body(response).await;
            let duration_ms = elapsed_ms(started);

            tracing::debug!(status = status.as_u16(), duration_ms, "received response");

            if status.is_success() {
                Ok(DeliveryResponse {
                    http_status_code: status.as_u16(),
                    body,
                    headers: Some(headers),
                    duration_ms: Some(duration_ms),
                })
            } else {
                Err(AttemptError::HttpStatus {
                    status_code: status.as_u16(),
                    body,
                    headers,
                    duration_ms,
                })
            }
        }
        .instrument(span)
        .await
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
    }
}

fn content_type(content_type: ContentType) -> &'static str {
    match content_type {
        ContentType::Json => "application/json",
        ContentType::FormUrlEncoded => "application/x-www-form-urlencoded",
    }
}

/// JSON payloads go out as stored. Form bodies flatten the top-level object:
/// strings verbatim, everything else as its JSON text.
fn encode_body(content_type: ContentType, payload: &str) -> Result<String, AttemptError> {
    match content_type {
        ContentType::Json => Ok(payload.to_string()),
        ContentType::FormUrlEncoded => {
            let value: serde_json::Value =
                serde_json::from_str(payload).map_err(|err| AttemptError::InvalidRequest {
                    message: format!("payload is not JSON: {err}"),
                })?;
            let serde_json::Value::Object(fields) = value else {
                return Err(AttemptError::InvalidRequest {
                    message: "form payload must be a JSON object".to_string(),
                });
            };
            let pairs: Vec<(String, String)> = fields
                .into_iter()
                .map(|(key, value)| match value {
                    serde_json::Value::String(text) => (key, text),
                    other => (key, other.to_string()),
                })
                .collect();
            serde_urlencoded::to_string(&pairs).map_err(|err| AttemptError::InvalidRequest {
                message: format!("cannot encode form payload: {err}"),
            })
        }
    }
}

async fn read_body(mut response: reqwest::Response) -> Option<String> {
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let room = MAX_RESPONSE_BODY_BYTES - buffer.len();
                if chunk.len() >= room {
                    buffer.extend_from_slice(&chunk[..room]);
                    break;
                }
                buffer.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read response body");
                break;
            }
        }
    }

    if buffer.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn extract_headers(header_map: &HeaderMap) -> BTreeMap<String, String> {
    header_map
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Headers the delivery system owns; webhook-configured values are ignored.
fn is_managed_header(name: &str) -> bool {
    let lowercase = name.to_ascii_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "transfer-encoding"
            | "x-webhook-event"
            | "x-webhook-delivery-id"
            | "x-webhook-attempt"
    )
}
