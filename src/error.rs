//! Status taxonomy shared by every layer of the serving core.
//!
//! Errors are propagated unchanged across layers: a shape mismatch detected
//! deep in normalization surfaces to the caller as the same `InvalidArg`
//! value that was constructed at the point of failure.

use std::fmt;

/// Errors produced by the serving core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Request or configuration malformed: shape mismatch, unknown
    /// input/output, batch bounds, duplicate input.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Unknown model, input, or output name.
    #[error("not found: {0}")]
    NotFound(String),

    /// Model not ready: never loaded, load failed, or being unloaded.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Duplicate response buffer allocation for one output name.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Request timed out before dispatch.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Backend crash, allocator failure, or pool exhaustion without
    /// fallback.
    #[error("internal: {0}")]
    Internal(String),

    /// Catch-all mapped from unexpected backend errors.
    #[error("unknown: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_arg(msg: impl fmt::Display) -> Self {
        Self::InvalidArg(msg.to_string())
    }

    pub fn not_found(msg: impl fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    pub fn unavailable(msg: impl fmt::Display) -> Self {
        Self::Unavailable(msg.to_string())
    }

    pub fn already_exists(msg: impl fmt::Display) -> Self {
        Self::AlreadyExists(msg.to_string())
    }

    pub fn deadline_exceeded(msg: impl fmt::Display) -> Self {
        Self::DeadlineExceeded(msg.to_string())
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// The message without the taxonomy prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArg(m)
            | Self::NotFound(m)
            | Self::Unavailable(m)
            | Self::AlreadyExists(m)
            | Self::DeadlineExceeded(m)
            | Self::Internal(m)
            | Self::Unknown(m) => m,
        }
    }
}
