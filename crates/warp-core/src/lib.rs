//! warp-core: Shared library for the warp terminal-sharing protocol.
//!
//! This crate provides:
//! - Protocol message definitions and wire format codec
//! - User, mode, and session-state data model
//! - Error types shared between daemon components
//! - Logging setup

pub mod constants;
pub mod error;
pub mod logging;
pub mod protocol;

pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
