//! Arbor State Engine - Version history and consensus-gated collapse
//!
//! This crate implements the per-object state of a replica:
//! - Version store (the DAG of versions)
//! - Materializer (topological replay onto a base value)
//! - Ack tracking per peer
//! - History collapse once every known peer has acknowledged a region
//! - Pending versions awaiting their insertion preconditions

pub mod acks;
pub mod collapse;
pub mod history;
pub mod object;
pub mod pending;
pub mod traversal;

pub use acks::*;
pub use collapse::*;
pub use history::*;
pub use object::*;
pub use pending::*;
pub use traversal::*;
