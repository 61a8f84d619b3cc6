use std::sync::Arc;

use reqwest::StatusCode;

/// Result type used by fallible operations inside the SDK and by [`IdentityStore`] and
/// [`HttpTransport`] implementations.
///
/// [`IdentityStore`]: crate::IdentityStore
/// [`HttpTransport`]: crate::HttpTransport
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the SDK.
///
/// Public [`Client`](crate::Client) operations never return these. They are logged and turned
/// into `None`/`false` at the operation boundary.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// The server answered with a status the operation does not accept.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(StatusCode),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Malformed JSON in a response body or in a persisted file.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    /// Error reported by a custom identity store.
    #[error("identity store error: {0}")]
    Storage(String),

    /// A purchase receipt could not be decoded.
    #[error("invalid purchase receipt: {0}")]
    InvalidReceipt(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

impl From<base64::DecodeError> for Error {
    fn from(value: base64::DecodeError) -> Self {
        Error::InvalidReceipt(value.to_string())
    }
}
