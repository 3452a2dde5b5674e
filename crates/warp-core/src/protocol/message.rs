//! Top-level protocol message enum.

use serde::{Deserialize, Serialize};

use super::{
    ClientUpdatePayload, CommandPayload, ErrorPayload, HelloPayload, HostUpdatePayload,
    SessionState,
};

/// Top-level protocol message type.
///
/// Hello must be the first frame each side sends; the remaining variants are
/// constrained by session role (hosts send `HostUpdate` and `Command`,
/// clients send `ClientUpdate`; `State` and `Error` flow daemon to peer,
/// except `HostUpdate` which the daemon also uses to deliver client input to
/// the host).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Session introduction with role, warp, and identity.
    Hello(HelloPayload),
    /// Host window/mode/output push, or daemon-to-host input delivery.
    HostUpdate(HostUpdatePayload),
    /// Client input keystrokes.
    ClientUpdate(ClientUpdatePayload),
    /// Session state snapshot.
    State(SessionState),
    /// Coded error, sent to one peer before closing or continuing.
    Error(ErrorPayload),
    /// Host control command (authorize / revoke / state echo).
    Command(CommandPayload),
}
