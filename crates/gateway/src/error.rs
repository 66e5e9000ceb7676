//! HTTP error mapping.
//!
//! Storage and service errors map onto conventional statuses; internals are
//! logged with context and surfaced as a generic message, never a stack
//! trace or key material.

use {
    axum::{
        Json,
        http::{StatusCode, header},
        response::{IntoResponse, Response},
    },
    serde_json::json,
    tracing::error,
};

use sotto_storage::StoreError;

pub struct ApiError {
    status: StatusCode,
    message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    #[must_use]
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "authentication required".into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self {
                status: StatusCode::NOT_FOUND,
                message: format!("{what} not found"),
                retry_after: None,
            },
            StoreError::Forbidden(why) => Self {
                status: StatusCode::FORBIDDEN,
                message: why.to_string(),
                retry_after: None,
            },
            StoreError::Conflict(why) => Self {
                status: StatusCode::CONFLICT,
                message: why.to_string(),
                retry_after: None,
            },
            StoreError::Validation(why) => Self {
                status: StatusCode::BAD_REQUEST,
                message: why,
                retry_after: None,
            },
            StoreError::RateLimited(scope) => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: format!("rate limit exceeded for {scope}"),
                retry_after: Some(3600),
            },
            StoreError::Database(e) => {
                error!(error = %e, "storage failure");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal error".into(),
                    retry_after: None,
                }
            }
        }
    }
}

impl From<sotto_crypto::CryptoError> for ApiError {
    fn from(e: sotto_crypto::CryptoError) -> Self {
        // Signature and length failures are the caller's problem, always 400.
        Self::bad_request(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        let mut response = (self.status, body).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
