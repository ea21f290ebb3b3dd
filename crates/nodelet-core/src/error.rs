//! Common error types for nodelet.
//!
//! This module provides shared error types that are used across crates.

use crate::ids::PodUid;
use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the node agent.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A pod with the specified UID is not known to this node.
    #[error("pod not found: {0}")]
    PodNotFound(PodUid),

    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}
