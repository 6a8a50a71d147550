// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the circulation mesh.
//!
//! Business outcomes (unknown book, loan on a loaned book, renewal cap) are
//! **not** errors: they travel as ordinary [`Response`](crate::protocol::Response)
//! tokens. Errors here are faults: bad input, unreachable replicas, failed
//! durable writes, lifecycle violations.
//!
//! # Error Categories
//!
//! | Error Type | Falls back | Description |
//! |------------|-----------|-------------|
//! | `Validation` | No | Malformed request or book id, rejected before any mutation |
//! | `Transport` | Yes | Endpoint unreachable, channel closed, reply dropped |
//! | `Timeout` | Yes | Endpoint did not answer within the bound |
//! | `Unavailable` | No | Neither replica answered |
//! | `Persistence` | No | Durable write/read failed (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Mesh is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Fallback Behavior
//!
//! Use [`MeshError::is_transport()`] to decide whether an operation actor
//! should hop to the secondary replica. Only transport-level failures qualify;
//! a primary that answered with a persistence failure is surfaced as-is.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Boxed future returned by the object-safe traits at component seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur inside the mesh.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Malformed request: unknown verb, missing or unparseable book id.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Endpoint unreachable or the exchange broke mid-flight.
    #[error("transport error ({endpoint}): {message}")]
    Transport { endpoint: String, message: String },

    /// Endpoint did not reply within the bound.
    #[error("timeout ({endpoint}) after {after:?}")]
    Timeout { endpoint: String, after: Duration },

    /// Both replicas failed for one request.
    #[error("neither replica reachable (primary: {primary}; secondary: {secondary})")]
    Unavailable { primary: String, secondary: String },

    /// Durable storage failed.
    ///
    /// The operation is reported failed even when nothing else went wrong.
    #[error("persistence error ({operation}): {message}")]
    Persistence {
        operation: String,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Create a transport error for the named endpoint.
    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a persistence error from a sqlx::Error
    pub fn persistence(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Persistence {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a persistence error without source
    pub fn persistence_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Whether this failure should trigger a fallback hop to the secondary.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Timeout { .. } => true,
            Self::Validation(_) => false,
            Self::Unavailable { .. } => false,
            Self::Persistence { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::Unavailable { .. } => "unavailable",
            Self::Persistence { .. } => "persistence",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for MeshError {
    fn from(e: sqlx::Error) -> Self {
        Self::persistence("unknown", e)
    }
}
