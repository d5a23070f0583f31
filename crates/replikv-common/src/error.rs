//! Error types for replikv
//!
//! This module defines the common error types used throughout the system.
//! A stale update is deliberately absent: the merge engine reports it as an
//! outcome, never as an error.

use thiserror::Error;

/// Common result type for replikv operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for replikv
#[derive(Debug, Error)]
pub enum Error {
    // Lifecycle errors
    #[error("store is already closed")]
    AlreadyClosed,

    // Network/correlation errors
    #[error("request timeout")]
    Timeout,

    #[error("no viable target instance")]
    NoViableTarget,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("dispatch queue is full")]
    QueueFull,

    // Encoding errors
    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a value codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a wire protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_) | Self::QueueFull)
    }

    /// Check if the peer simply did not answer in time.
    ///
    /// The remote side may still have applied the request.
    #[must_use]
    pub fn is_no_answer(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
