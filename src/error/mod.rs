//! OAuth2 Error Types
//!
//! Error hierarchy for the request interceptor, plus the reporting taxonomy used by the
//! configured error sink.

use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Root error type for OAuth2 integration.
#[derive(Error, Debug)]
pub enum OAuth2Error {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Authorization error: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Request aborted")]
    Aborted,
}

impl OAuth2Error {
    /// Stable error code for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "OAUTH2_CONFIG",
            Self::Authorization(_) => "OAUTH2_AUTH",
            Self::Token(_) => "OAUTH2_TOKEN",
            Self::Network(_) => "OAUTH2_NETWORK",
            Self::Storage(_) => "OAUTH2_STORAGE",
            Self::Protocol(_) => "OAUTH2_PROTOCOL",
            Self::Request(_) => "OAUTH2_REQUEST",
            Self::Aborted => "OAUTH2_ABORTED",
        }
    }

    /// Whether the transport failed before producing any HTTP status.
    ///
    /// Such failures surface to the request state machine as status `0`. A response that
    /// arrived but could not be read is not one of them.
    pub fn is_opaque_failure(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::ConnectionFailed { .. } | NetworkError::Timeout { .. })
        )
    }

    /// Provider error body to hand to the error sink, when the provider sent one.
    pub fn error_data(&self) -> Option<serde_json::Value> {
        match self {
            Self::Authorization(AuthorizationError::CodeExchangeRejected { body, .. }) => {
                Some(body.clone())
            }
            Self::Token(TokenError::RefreshRejected { body, .. }) => Some(body.clone()),
            Self::Authorization(AuthorizationError::Denied {
                error,
                error_description,
                error_uri,
            }) => Some(serde_json::json!({
                "error": error,
                "error_description": error_description,
                "error_uri": error_uri,
            })),
            _ => None,
        }
    }
}

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("{field} not defined for OAuth2")]
    MissingRequired { field: String },

    #[error("Invalid endpoint URL: {url}")]
    InvalidEndpoint { url: String },
}

/// Authorization flow error.
#[derive(Error, Debug)]
pub enum AuthorizationError {
    #[error("Authorization denied: {error}")]
    Denied {
        error: String,
        error_description: Option<String>,
        error_uri: Option<String>,
    },

    #[error("Authorization code exchange rejected: {error}")]
    CodeExchangeRejected {
        error: String,
        error_description: Option<String>,
        body: serde_json::Value,
    },

    #[error("Authorization redirect carried no code")]
    MissingCode,

    #[error("No authorization redirect received within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Authorization popup could not be opened: {message}")]
    PopupFailed { message: String },
}

/// Token-related error.
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Refresh token rejected: {error}")]
    RefreshRejected {
        error: String,
        body: serde_json::Value,
    },

    #[error("No refresh token available")]
    NoRefreshToken,
}

/// Network/transport error.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Request timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("TLS error: {message}")]
    TlsError { message: String },

    #[error("Request failed without a status while credentials were sent as a query parameter")]
    Opaque,
}

/// Protocol/response parsing error.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Unexpected redirect to: {location}")]
    UnexpectedRedirect { location: String },

    #[error("Response too large: {size} bytes")]
    ResponseTooLarge { size: usize },

    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String },
}

/// Storage error.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Read failed: {message}")]
    ReadFailed { message: String },

    #[error("Write failed: {message}")]
    WriteFailed { message: String },

    #[error("Corrupted data: {message}")]
    CorruptedData { message: String },
}

/// Misuse of the request object.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("send() called before open()")]
    NotOpened,
}

/// Result type for OAuth2 operations.
pub type OAuth2Result<T> = Result<T, OAuth2Error>;

/// OAuth2 error response from provider.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuth2ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_uri: Option<String>,
}

/// Parse error response from HTTP body.
pub fn parse_error_response(body: &str) -> Option<OAuth2ErrorResponse> {
    serde_json::from_str(body).ok()
}

/// Failure categories reported to the configured [`ErrorSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Zero-status failure while already sending the token as a query parameter.
    NetworkError,
    /// The authorization step failed (code exchange rejected, denied, timed out).
    Authorize,
    /// The refresh-token exchange failed; interactive authorization follows.
    Refresh,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "network-error",
            Self::Authorize => "authorize",
            Self::Refresh => "refresh",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver for unrecoverable failures.
pub trait ErrorSink: Send + Sync {
    /// Report a failure with the provider's error body, when there is one.
    fn report(&self, kind: ErrorKind, data: Option<&serde_json::Value>);
}

/// Default sink: logs the failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, kind: ErrorKind, data: Option<&serde_json::Value>) {
        match data {
            Some(data) => tracing::warn!(kind = %kind, data = %data, "OAuth2 error"),
            None => tracing::warn!(kind = %kind, "OAuth2 error"),
        }
    }
}

/// Sink that records every report, for tests and host-side inspection.
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<(ErrorKind, Option<serde_json::Value>)>>,
}

impl RecordingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All reports in arrival order.
    pub fn reports(&self) -> Vec<(ErrorKind, Option<serde_json::Value>)> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of reports of the given kind.
    pub fn count(&self, kind: ErrorKind) -> usize {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, kind: ErrorKind, data: Option<&serde_json::Value>) {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((kind, data.cloned()));
    }
}
