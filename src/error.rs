//! Error handling and JSON error responses for the gateway

use crate::pool::{full_body, GatewayBody};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error code
pub const X_GATEWAY_ERROR: &str = "X-Gateway-Error";

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Path does not match a backend or a local route
    UnknownRoute,
    /// Backend's circuit breaker is rejecting calls
    CircuitOpen,
    /// Failed to connect to backend
    BackendUnavailable,
    /// Backend did not respond in time
    RequestTimeout,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            GatewayErrorCode::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::RequestTimeout => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            GatewayErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            GatewayErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
    /// Backend the request was routed to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }

    pub fn into_response(self) -> Response<GatewayBody> {
        let status = self.code.status_code();
        let header = self.code.as_header_value();

        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header(X_GATEWAY_ERROR, header)
            .body(full_body(self.to_json()))
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    ErrorResponse::new(code, message).into_response()
}

/// Create a JSON error response naming the backend it concerns
pub fn backend_error_response(
    code: GatewayErrorCode,
    backend: &str,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    ErrorResponse::new(code, message)
        .with_backend(backend)
        .into_response()
}
