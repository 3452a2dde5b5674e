//! Protocol module for the warp wire format.
//!
//! This module provides:
//! - User, mode, and session-state data model
//! - Message types and payloads
//! - Length-prefixed bincode codec

mod codec;
mod message;
mod types;

#[cfg(test)]
mod proptest;

pub use codec::{Codec, FRAME_HEADER_LEN};
pub use message::Message;
pub use types::*;
