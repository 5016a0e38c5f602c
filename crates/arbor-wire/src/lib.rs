//! Arbor Wire Protocol - Messages and framing
//!
//! This crate implements what travels between peers:
//! - Protocol messages (Hello, HelloBack, VersionPush, VersionAck)
//! - Length-prefixed frames with a JSON body
//! - A streaming frame decoder

pub mod frame;
pub mod message;

pub use frame::*;
pub use message::*;
