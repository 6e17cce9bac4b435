use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::{
    delivery::TransitionError,
    dispatcher::DispatchError,
    store::StoreError,
    types::{ApiErrorCode, ApiErrorResponse},
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    MalformedBody { status: StatusCode, message: String },
    InvalidPayload(String),
    Unauthorized(String),
    NotFound(String),
    InvalidTransition(TransitionError),
    ConcurrentUpdate(String),
    Db(sqlx::Error),
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    fn parts(self) -> (StatusCode, ApiErrorCode, String) {
        match self {
            Self::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, ApiErrorCode::BadRequest, message)
            }
            Self::MalformedBody { status, message } => {
                (status, ApiErrorCode::MalformedBody, message)
            }
            Self::InvalidPayload(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ApiErrorCode::InvalidPayload,
                message,
            ),
            Self::Unauthorized(message) => {
                (StatusCode::UNAUTHORIZED, ApiErrorCode::Unauthorized, message)
            }
            Self::NotFound(message) => (StatusCode::NOT_FOUND, ApiErrorCode::NotFound, message),
            Self::InvalidTransition(err) => (
                StatusCode::CONFLICT,
                ApiErrorCode::InvalidTransition,
                err.to_string(),
            ),
            Self::ConcurrentUpdate(message) => {
                (StatusCode::CONFLICT, ApiErrorCode::ConcurrentUpdate, message)
            }
            Self::Db(err) => {
                error!(error = %err, "database error in request");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ApiErrorCode::StorageUnavailable,
                    "delivery store unavailable".to_string(),
                )
            }
            Self::Internal(message) => {
                error!(error = %message, "internal error in request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorCode::Internal,
                    message,
                )
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => Self::ConcurrentUpdate(message),
            StoreError::Db(db) => Self::Db(db),
            StoreError::NotFound(message) => Self::NotFound(message),
            StoreError::Parse(message) => Self::Internal(message),
        }
    }
}

impl From<TransitionError> for ApiError {
    fn from(err: TransitionError) -> Self {
        Self::InvalidTransition(err)
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Store(err) => err.into(),
            DispatchError::Transition(err) => err.into(),
            DispatchError::InvalidPayload(message) => Self::InvalidPayload(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!(reason = %rejection.body_text(), "request body rejected");
        Self::MalformedBody {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        debug!(reason = %rejection.body_text(), "query string rejected");
        Self::BadRequest(format!("invalid query: {}", rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        debug!(reason = %rejection.body_text(), "path rejected");
        Self::BadRequest(format!("invalid path: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        (status, Json(ApiErrorResponse { code, message })).into_response()
    }
}
