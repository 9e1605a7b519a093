//! Error Type Definition Module
//!
//! Construction-time failures are returned as `RtInferError`. Fast-path
//! shortages (no free slot, ring over/underflow, full job queue) are
//! reported through the log sink and mitigated with silence instead,
//! so the audio callback never sees an error value.

use thiserror::Error;

/// Main error type for the rtinfer library
#[derive(Debug, Clone, Error)]
pub enum RtInferError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor shape related errors
    #[error("Tensor shape error: {0}")]
    Shape(String),

    /// Model data related errors
    #[error("Model error: {0}")]
    Model(String),

    /// Backend construction or inference errors
    #[error("Backend error: {0}")]
    Backend(String),

    /// Session lifecycle errors
    #[error("Session error: {0}")]
    Session(String),

    /// File I/O related errors
    #[error("File I/O error: {0}")]
    Io(String),
}

impl RtInferError {
    /// Create new config error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create new shape error
    pub fn shape<S: Into<String>>(message: S) -> Self {
        Self::Shape(message.into())
    }

    /// Create new model error
    pub fn model<S: Into<String>>(message: S) -> Self {
        Self::Model(message.into())
    }

    /// Create new backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend(message.into())
    }

    /// Create new session error
    pub fn session<S: Into<String>>(message: S) -> Self {
        Self::Session(message.into())
    }

    /// Create new IO error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io(message.into())
    }
}

/// Library result type alias
pub type Result<T> = std::result::Result<T, RtInferError>;

impl From<std::io::Error> for RtInferError {
    fn from(err: std::io::Error) -> Self {
        RtInferError::io(err.to_string())
    }
}
