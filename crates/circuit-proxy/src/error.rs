//! Error types for the circuit-proxy crate.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("Request header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Unsupported URL scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    #[error("Authentication check failed: {0}")]
    Auth(#[from] AuthError),

    #[error("No free circuit after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Host not found: {host}")]
    NameNotFound { host: String },

    #[error("Upstream connection failed to {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("Control port error on {port}: {reason}")]
    Control { port: u16, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// HTTP status and reason phrase reported to the client for this error,
    /// provided nothing has been written to it yet.
    #[must_use]
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            ProxyError::HttpParse(_) | ProxyError::UnsupportedScheme { .. } => {
                (400, "Bad Request")
            }
            ProxyError::HeaderTooLarge { .. } => (431, "Request Header Fields Too Large"),
            ProxyError::BodyTooLarge { .. } => (413, "Payload Too Large"),
            ProxyError::PoolExhausted { .. } => (503, "Service Unavailable"),
            ProxyError::NameNotFound { .. } => (404, "Not Found"),
            _ => (500, "Internal Server Error"),
        }
    }
}

/// Failure of the authentication policy itself, as opposed to a request
/// that was checked and refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct AuthError(pub String);

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
