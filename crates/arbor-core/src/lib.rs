//! Arbor Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout Arbor:
//! - Identifiers (PeerId, ObjectId, VersionId)
//! - Key-path patches and the patch engine
//! - Versions as they are stored and as they travel
//! - The error taxonomy shared by every crate

pub mod error;
pub mod id;
pub mod patch;
pub mod version;

pub use error::*;
pub use id::*;
pub use patch::*;
pub use version::*;

/// Materialized object value - a JSON-compatible tree
pub type Value = serde_json::Value;
