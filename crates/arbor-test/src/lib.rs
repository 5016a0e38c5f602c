//! Arbor Test Harness - Deterministic simulation of sync networks
//!
//! This crate provides:
//! - A tick-based network simulator with per-link FIFO delivery
//! - Latency, jitter and duplication injection from a seeded RNG
//! - A scenario builder that wires peers from a topology

pub mod scenario;
pub mod simulator;

pub use scenario::*;
pub use simulator::*;
