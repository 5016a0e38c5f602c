//! Arbor Transport - Moving frames between peers
//!
//! This crate provides:
//! - An in-process transport on tokio channels, one task per peer
//! - Per-link FIFO delivery of encoded wire frames
//! - Settling: waiting until no frame is in flight

pub mod local;

pub use local::*;
