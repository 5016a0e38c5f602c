//! Arbor Topology - Who a peer talks to, and who it must agree with
//!
//! - Peer links: the live connections of one peer and its relay role
//! - Known peers: every identity ever observed, the collapse quorum
//! - Layouts: star, mesh and chain wirings for whole networks

pub mod known;
pub mod links;
pub mod topology;

pub use known::*;
pub use links::*;
pub use topology::*;
