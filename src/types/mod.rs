pub mod webhook;
pub mod webhook_delivery;
pub mod delivery_attempt_log;
pub mod circuit_breaker;
pub mod stats;
pub mod admin;
pub mod api_error;

#[allow(unused_imports)]
pub use webhook::{ContentType, DeliveryOutcome, HttpMethod, Webhook, WebhookStatus};
#[allow(unused_imports)]
pub use webhook_delivery::{DeliveryStatus, WebhookDelivery};
#[allow(unused_imports)]
pub use delivery_attempt_log::{AttemptErrorKind, DeliveryAttemptLog};
#[allow(unused_imports)]
pub use circuit_breaker::{CircuitBreakerStats, CircuitState};
#[allow(unused_imports)]
pub use stats::{DeliveryStats, ErrorAnalysis, HealthMetrics};
#[allow(unused_imports)]
pub use admin::{
    CreateWebhookRequest, EmitEventResponse, ListAttemptsResponse, ListCircuitsResponse,
    ListDeliveriesResponse, UpdateWebhookStatusRequest, UpdateWebhookStatusResponse,
    WebhookResponse,
};
#[allow(unused_imports)]
pub use api_error::{ApiErrorCode, ApiErrorResponse};
