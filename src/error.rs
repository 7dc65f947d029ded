//! Error kinds and JSON error responses for the proxy

use crate::lifecycle::BackendState;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Request-level failures, delivered to the waiting handler through its
/// completion handle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("Server is busy, request queue is full")]
    QueueFull,

    #[error("Server is busy, timed out adding request to queue")]
    QueueAdmissionTimeout,

    #[error("Request expired while waiting for server to start")]
    RequestExpired,

    #[error("Target server took longer than {} seconds to respond", .0.as_secs())]
    UpstreamTimeout(Duration),

    #[error("Error communicating with target server: {0}")]
    UpstreamConnection(String),

    #[error("Internal error forwarding request: {0}")]
    InternalForwarding(String),

    /// The queue was cleared, e.g. because the backend failed to start
    #[error("{reason}")]
    Cancelled { reason: String },
}

impl ProxyError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProxyError::QueueFull => ProxyErrorCode::QueueFull,
            ProxyError::QueueAdmissionTimeout => ProxyErrorCode::QueueAdmissionTimeout,
            ProxyError::RequestExpired => ProxyErrorCode::RequestExpired,
            ProxyError::UpstreamTimeout(_) => ProxyErrorCode::UpstreamTimeout,
            ProxyError::UpstreamConnection(_) => ProxyErrorCode::ConnectionFailed,
            ProxyError::InternalForwarding(_) => ProxyErrorCode::InternalError,
            ProxyError::Cancelled { .. } => ProxyErrorCode::RequestCancelled,
        }
    }

    /// Render this error as the synthetic response sent to the client
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.to_string())
    }
}

/// Transition-level failures reported by the lifecycle manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// The management command kept failing after every retry
    #[error("power {operation} command failed after retries")]
    PowerCommandFailure { operation: &'static str },

    /// `expected` is either "reachable" or "unreachable"
    #[error("backend did not become {expected} within {} seconds", .timeout.as_secs())]
    ReachabilityTimeout {
        expected: &'static str,
        timeout: Duration,
    },

    /// The requested transition has no edge from the current state
    #[error("cannot change power state while backend is {0}")]
    TransitionInProgress(BackendState),
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request queue is at capacity
    QueueFull,
    /// Request could not be admitted into the queue in time
    QueueAdmissionTimeout,
    /// Request waited in the queue longer than the request timeout
    RequestExpired,
    /// Backend did not answer within the upstream timeout
    UpstreamTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Queued request was cancelled, e.g. the backend failed to start
    RequestCancelled,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::QueueFull
            | ProxyErrorCode::QueueAdmissionTimeout
            | ProxyErrorCode::RequestExpired
            | ProxyErrorCode::RequestCancelled
            | ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::QueueFull => "QUEUE_FULL",
            ProxyErrorCode::QueueAdmissionTimeout => "QUEUE_ADMISSION_TIMEOUT",
            ProxyErrorCode::RequestExpired => "REQUEST_EXPIRED",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestCancelled => "REQUEST_CANCELLED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
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
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
