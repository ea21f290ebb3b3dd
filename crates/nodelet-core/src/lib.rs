//! Core types and utilities for nodelet.
//!
//! This crate provides the foundational types shared by the node agent:
//!
//! - **Identifiers**: Strongly-typed pod UIDs and container IDs
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use nodelet_core::{ContainerId, PodUid};
//!
//! // UIDs handed out by the API server
//! let uid = PodUid::new("0f8b2c0e-6a53-4c1e-9d67-0f0e7b1f0c2a").unwrap();
//!
//! // UIDs for statically configured pods are derived from the manifest
//! let static_uid = PodUid::for_static_pod("node-1", "file", b"kind: Pod");
//! assert_ne!(uid, static_uid);
//!
//! let container: ContainerId = "containerd://abc".parse().unwrap();
//! assert_eq!(container.id(), "abc");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;

pub use error::{CoreError, Result};
pub use ids::{ContainerId, IdError, PodUid};
