//! Endpoint plumbing shared by API handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::auth::{Identity, TokenError};
use crate::gate::directive::REMOTE_ADDR_HEADER;
use crate::worker::runtime::WorkerState;

/// Error returned by API handlers, rendered as
/// `{"message": ..., "exception": ...}`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EndpointError {
    pub status: StatusCode,
    pub message: String,
    pub exception: &'static str,
}

impl EndpointError {
    pub fn new(status: StatusCode, exception: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            exception,
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "SecurityError",
            "Authorization required",
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "EndpointError", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "EndpointError", message)
    }
}

impl From<TokenError> for EndpointError {
    fn from(e: TokenError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.kind(), e.to_string())
    }
}

impl IntoResponse for EndpointError {
    fn into_response(self) -> Response {
        let body = if self.status == StatusCode::UNAUTHORIZED {
            json!({"message": self.message})
        } else {
            json!({"message": self.message, "exception": self.exception})
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for EndpointError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

pub type EndpointResult<T> = Result<Json<T>, EndpointError>;

/// JSON request body whose rejections render as [`EndpointError`].
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = EndpointError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state).await?;
        Ok(JsonBody(value))
    }
}

/// Extractor requiring a logged-in worker.
pub struct Authenticated(pub Identity);

impl FromRequestParts<WorkerState> for Authenticated {
    type Rejection = EndpointError;

    async fn from_request_parts(
        _parts: &mut Parts,
        state: &WorkerState,
    ) -> Result<Self, Self::Rejection> {
        state
            .identity
            .clone()
            .map(Authenticated)
            .ok_or_else(EndpointError::unauthorized)
    }
}

/// Client address as reported by the master.
pub struct RemoteAddr(pub String);

impl<S: Send + Sync> FromRequestParts<S> for RemoteAddr {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(RemoteAddr(
            parts
                .headers
                .get(&REMOTE_ADDR_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string(),
        ))
    }
}
