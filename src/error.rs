//! Error types for the WebUI chat SDK

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the SDK
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error (connection refused, DNS, body read failure, timeout)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O error (reading files for upload)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Server answered with a non-success status
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body or a short description
        message: String,
    },

    /// All attempts of a retryable request failed
    #[error("Request failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Total number of attempts made, including the first one
        attempts: u32,
        /// The error returned by the final attempt
        #[source]
        source: Box<Error>,
    },

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Local chat state does not match what an operation expects
    /// (chat missing, placeholder missing, broken parent link)
    #[error("Chat state error: {0}")]
    State(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error for the given status code
    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Error::Api {
            status,
            message: msg.into(),
        }
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new chat state error
    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// HTTP status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            Error::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// True for failures worth retrying: network errors, timeouts, 5xx
    /// responses and broken streams.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => match e.status() {
                Some(status) => status.is_server_error(),
                None => !e.is_decode() && !e.is_builder(),
            },
            Error::Timeout => true,
            Error::Stream(_) => true,
            Error::Api { status, .. } => *status >= 500,
            Error::RetriesExhausted { .. } => true,
            _ => false,
        }
    }

    /// True for failures that will not go away by repeating the same request
    /// (4xx responses, bad payloads, bad configuration).
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::Api { status, .. } => (400..500).contains(status),
            Error::Json(_) | Error::Config(_) | Error::InvalidInput(_) => true,
            _ => false,
        }
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}
