//! Error types for discovery and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No route registered for the host
    UnknownHost,
    /// Failed to connect to backend
    ConnectionFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
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
    let body = error.to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "x-proxy-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

/// Failure reported by a container source
#[derive(Debug, Error)]
pub enum SourceError {
    /// Error returned by the Docker Engine API
    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// The container does not exist (anymore)
    #[error("container not found: {0}")]
    NotFound(String),

    /// The event subscription ended without an error
    #[error("event stream closed")]
    StreamClosed,

    #[error("{0}")]
    Other(String),
}

/// Failure to turn a labeled container into a route
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("failed to inspect container: {0}")]
    Inspect(#[from] SourceError),

    #[error("container IP address not found: {0}")]
    NoAddress(String),

    #[error("invalid port label {value:?} on container {container_id}")]
    InvalidPort { container_id: String, value: String },
}

/// Failure reason returned by an event handler
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("{0}")]
    Other(String),
}

/// A handler failed while an event was being dispatched
#[derive(Debug, Error)]
#[error("handler {handler} failed on {action} event for container {container_id}: {source}")]
pub struct DispatchError {
    pub action: String,
    pub handler: String,
    pub container_id: String,
    #[source]
    pub source: HandlerError,
}

/// Fatal errors of the discovery orchestrator
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to list containers: {0}")]
    List(#[source] SourceError),

    #[error("failed to register container {container_id}: {source}")]
    Register {
        container_id: String,
        #[source]
        source: RegistrationError,
    },

    #[error("error monitoring events after {attempts} reconnect attempts: {source}")]
    Stream {
        attempts: u32,
        #[source]
        source: SourceError,
    },

    #[error("HTTP server error: {0}")]
    Server(#[from] std::io::Error),
}
