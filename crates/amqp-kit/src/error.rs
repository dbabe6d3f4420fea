//! Error types for the messaging framework.

use crate::transport::TransportError;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for framework operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by endpoints, decoders and encoders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The same queue was registered more than once.
    #[error("duplicate queue entry: '{0}'")]
    DuplicateQueue(String),

    /// Broker transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No broker connection is currently established.
    #[error("not connected to broker")]
    NotConnected,

    /// A consume feed ended without a stop request.
    #[error("delivery feed closed")]
    FeedClosed,

    /// The client has been closed.
    #[error("client closed")]
    Closed,

    /// JSON serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection string could not be built or parsed.
    #[error("invalid dsn: {0}")]
    InvalidDsn(String),
}

/// Structured error carried in error replies.
///
/// `status_code` is an HTTP-style severity used to classify the failure; it
/// never becomes an actual HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct CodedError {
    /// Machine-readable code chosen by the caller.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP-style status code.
    pub status_code: u16,
}

impl CodedError {
    /// Create a new coded error.
    pub fn new(message: impl Into<String>, code: impl Into<String>, status: StatusCode) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status_code: status.as_u16(),
        }
    }

    /// Keep the code and status of `self` but replace the message.
    #[must_use]
    pub fn wrap(&self, message: impl Into<String>) -> Self {
        Self {
            code: self.code.clone(),
            message: message.into(),
            status_code: self.status_code,
        }
    }

    /// An uncoded failure, reported as an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(message, "", StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Convert any boxed error into a coded one.
    ///
    /// Errors that already are a [`CodedError`] keep their code and status.
    #[must_use]
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<Self>() {
            Ok(coded) => *coded,
            Err(other) => Self::internal(other.to_string()),
        }
    }
}

/// Reply envelope with a data and an error side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response<T> {
    /// Successful payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CodedError>,
}

impl<T> Response<T> {
    /// A successful reply.
    pub const fn data(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    /// A failed reply.
    pub const fn error(error: CodedError) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }
}
