use std::net::IpAddr;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Header set on 429 responses so clients can tell our limiting apart from
/// the destination's own.
pub const RATE_LIMIT_SOURCE_HEADER: &str = "x-ratelimit-source";
pub const RATE_LIMIT_SOURCE_VALUE: &str = "specificproxy";

/// Unified error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    // Egress selection
    #[error("invalid egress IP format: {0}")]
    InvalidEgressIp(String),

    #[error("specified egress IP is not allowed: {0}")]
    EgressNotAllowed(IpAddr),

    #[error("no available egress IPs")]
    NoEgressAvailable,

    #[error("server misconfigured: {0}")]
    Misconfigured(String),

    // Rate limiting
    #[error("invalid X-Rate-Limit header: {0}")]
    InvalidRateLimit(String),

    #[error("rate limit exceeded")]
    RateLimited,

    // Request errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Upstream errors
    #[error("failed to reach destination: {0}")]
    UpstreamUnavailable(String),

    #[error("connection upgrade not supported")]
    UpgradeUnsupported,

    // Configuration errors
    #[error("invalid configuration: {0}")]
    Config(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ProxyError::InvalidEgressIp(_)
            | ProxyError::InvalidRateLimit(_)
            | ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 403 Forbidden
            ProxyError::EgressNotAllowed(_) => StatusCode::FORBIDDEN,

            // 429 Too Many Requests
            ProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,

            // 502 Bad Gateway
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            ProxyError::NoEgressAvailable => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            ProxyError::Misconfigured(_)
            | ProxyError::UpgradeUnsupported
            | ProxyError::Config(_)
            | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Proxy clients get plain text, not JSON
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, self.to_string()).into_response();

        if matches!(self, ProxyError::RateLimited) {
            response.headers_mut().insert(
                RATE_LIMIT_SOURCE_HEADER,
                HeaderValue::from_static(RATE_LIMIT_SOURCE_VALUE),
            );
        }
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );

        response
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::UpstreamUnavailable(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}
