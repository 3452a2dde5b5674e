//! Wire data model and message payloads for the warp protocol.
//!
//! Per PROTOCOL conventions: payloads are serialized with bincode behind a
//! 4-byte big-endian length prefix. Tokens are server-issued and opaque;
//! clients keep identity across sessions by resubmitting their token.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_COLS, DEFAULT_ROWS, GUEST_TOKEN_PREFIX, HOST_TOKEN_PREFIX, TOKEN_SUFFIX_LEN,
};

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a warp, chosen by the host at open time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WarpId(String);

impl WarpId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WarpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-issued opaque token binding a party to a warp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserToken(String);

impl UserToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Issue a fresh token for a non-host user.
    pub fn generate_guest() -> Self {
        Self(format!("{GUEST_TOKEN_PREFIX}{}", random_suffix()))
    }

    /// Issue a fresh token for a host.
    pub fn generate_host() -> Self {
        Self(format!("{HOST_TOKEN_PREFIX}{}", random_suffix()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_SUFFIX_LEN)
        .map(char::from)
        .collect()
}

// =============================================================================
// Modes
// =============================================================================

/// Capability bitset per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mode(u32);

impl Mode {
    /// May receive terminal output.
    pub const SHELL_READ: Mode = Mode(1);
    /// May inject input into the host terminal.
    pub const SHELL_WRITE: Mode = Mode(1 << 1);

    pub const fn empty() -> Self {
        Mode(0)
    }

    pub const fn union(self, other: Mode) -> Self {
        Mode(self.0 | other.0)
    }

    pub const fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Mode) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Mode) {
        self.0 &= !other.0;
    }
}

// =============================================================================
// Users and Session State
// =============================================================================

/// Terminal window dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// Snapshot of one connected user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub token: UserToken,
    pub username: String,
    pub mode: Mode,
    pub hosting: bool,
}

/// Authoritative summary of a warp, broadcast on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub warp: WarpId,
    pub window_size: WindowSize,
    pub users: Vec<UserState>,
    /// True once the host has departed; the warp is being torn down.
    pub disconnected: bool,
}

impl SessionState {
    /// Look up a user snapshot by token.
    pub fn user(&self, token: &UserToken) -> Option<&UserState> {
        self.users.iter().find(|u| &u.token == token)
    }
}

// =============================================================================
// Message Payloads
// =============================================================================

/// Role declared in a session's hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionType {
    /// Streams terminal output; consumes authorized input.
    Host,
    /// Receives terminal output; may be granted write access.
    ShellClient,
}

/// First frame each side sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Protocol version (must be [`crate::constants::PROTOCOL_VERSION`]).
    pub protocol_version: u32,
    pub session_type: SessionType,
    pub warp: WarpId,
    pub username: String,
    /// Previously issued token, if reconnecting. Absent tokens are issued.
    pub token: Option<UserToken>,
}

/// Host state push. Host-to-daemon frames leave `from` unset; the daemon
/// reuses the same shape to deliver client input to the host, recording the
/// originating token in `from`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostUpdatePayload {
    pub from: Option<UserToken>,
    pub window_size: WindowSize,
    /// Host's view of client modes. Merged into the user table: tokens
    /// absent from the map are left untouched.
    pub modes: HashMap<UserToken, Mode>,
    /// PTY output (host to daemon) or client keystrokes (daemon to host).
    pub data: Vec<u8>,
}

/// PTY input keystrokes from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientUpdatePayload {
    pub data: Vec<u8>,
}

/// Host control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Request a state snapshot echo.
    State,
    /// Grant `SHELL_WRITE` to the listed users.
    Authorize,
    /// Remove `SHELL_WRITE` from the listed users (all non-hosts if empty).
    Revoke,
}

/// Control command submitted by the host session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub kind: CommandKind,
    /// Usernames or tokens of connected non-host users.
    pub args: Vec<String>,
}

/// Coded error reported to one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Short stable code, see [`error_code`].
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Stable wire error codes. `warp_in_use` and `warp_unknown` are relied on
/// verbatim by released clients and must never change.
pub mod error_code {
    pub const WARP_IN_USE: &str = "warp_in_use";
    pub const WARP_UNKNOWN: &str = "warp_unknown";
    pub const SLOW_CONSUMER: &str = "slow_consumer";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const INVALID_COMMAND: &str = "invalid_command";
}

// =============================================================================
// Tests
// =============================================================================
