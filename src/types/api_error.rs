use serde::{Deserialize, Serialize};
use specta::Type;

/// Machine-readable reason carried by every non-2xx admin response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorCode {
    /// A field, query parameter or path segment failed validation.
    BadRequest,
    /// The request body was not the JSON shape the route expects.
    MalformedBody,
    /// An emitted event payload was rejected before fan-out.
    InvalidPayload,
    Unauthorized,
    NotFound,
    /// The delivery is in a status that does not allow the requested change.
    InvalidTransition,
    /// The row moved under the request (another worker or admin wrote first).
    ConcurrentUpdate,
    StorageUnavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ApiErrorResponse {
    pub code: ApiErrorCode,
    pub message: String,
}
