//! warpd: rendezvous daemon for warp terminal sharing.
//!
//! One host streams its terminal through a named warp; any number of
//! clients subscribe to the output, and the host can grant or revoke the
//! right to inject input. The daemon multiplexes each warp between its
//! host and clients and enforces per-client access rights.

pub mod broadcast;
pub mod cli;
pub mod collector;
pub mod session;
pub mod srv;
pub mod tls;
pub mod warp;

pub use cli::Cli;
pub use srv::{Srv, SrvConfig};
