//! Property-based tests for the protocol codec.
//!
//! These tests use proptest to verify:
//! - Codec roundtrip for arbitrary messages
//! - Codec never panics on arbitrary input
//! - Length prefix correctness

#![cfg(test)]

use std::collections::HashMap;

use bytes::BytesMut;
use proptest::prelude::*;

use crate::protocol::{
    ClientUpdatePayload, Codec, CommandKind, CommandPayload, ErrorPayload, FRAME_HEADER_LEN,
    HelloPayload, HostUpdatePayload, Message, Mode, SessionState, SessionType, UserState,
    UserToken, WarpId, WindowSize,
};

// =============================================================================
// Arbitrary Generators
// =============================================================================

fn arb_token() -> impl Strategy<Value = UserToken> {
    "[a-zA-Z0-9_]{1,24}".prop_map(UserToken::new)
}

fn arb_mode() -> impl Strategy<Value = Mode> {
    prop_oneof![
        Just(Mode::empty()),
        Just(Mode::SHELL_READ),
        Just(Mode::SHELL_WRITE),
        Just(Mode::SHELL_READ.union(Mode::SHELL_WRITE)),
    ]
}

prop_compose! {
    fn arb_window_size()(
        cols in 1u16..=500,
        rows in 1u16..=200,
    ) -> WindowSize {
        WindowSize { cols, rows }
    }
}

prop_compose! {
    fn arb_hello()(
        protocol_version in any::<u32>(),
        host in any::<bool>(),
        warp in "[a-z0-9-]{1,32}",
        username in "[a-zA-Z0-9]{1,16}",
        token in prop::option::of(arb_token()),
    ) -> HelloPayload {
        HelloPayload {
            protocol_version,
            session_type: if host { SessionType::Host } else { SessionType::ShellClient },
            warp: WarpId::new(warp),
            username,
            token,
        }
    }
}

prop_compose! {
    fn arb_host_update()(
        from in prop::option::of(arb_token()),
        window_size in arb_window_size(),
        modes in prop::collection::hash_map(arb_token(), arb_mode(), 0..8),
        data in prop::collection::vec(any::<u8>(), 0..1024),
    ) -> HostUpdatePayload {
        HostUpdatePayload {
            from,
            window_size,
            modes: modes.into_iter().collect::<HashMap<_, _>>(),
            data,
        }
    }
}

prop_compose! {
    fn arb_user_state()(
        token in arb_token(),
        username in "[a-zA-Z0-9]{1,16}",
        mode in arb_mode(),
        hosting in any::<bool>(),
    ) -> UserState {
        UserState { token, username, mode, hosting }
    }
}

prop_compose! {
    fn arb_session_state()(
        warp in "[a-z0-9-]{1,32}",
        window_size in arb_window_size(),
        users in prop::collection::vec(arb_user_state(), 0..8),
        disconnected in any::<bool>(),
    ) -> SessionState {
        SessionState {
            warp: WarpId::new(warp),
            window_size,
            users,
            disconnected,
        }
    }
}

fn arb_command_kind() -> impl Strategy<Value = CommandKind> {
    prop_oneof![
        Just(CommandKind::State),
        Just(CommandKind::Authorize),
        Just(CommandKind::Revoke),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        arb_hello().prop_map(Message::Hello),
        arb_host_update().prop_map(Message::HostUpdate),
        prop::collection::vec(any::<u8>(), 0..1024)
            .prop_map(|data| Message::ClientUpdate(ClientUpdatePayload { data })),
        arb_session_state().prop_map(Message::State),
        ("[a-z_]{1,24}", "[ -~]{0,64}")
            .prop_map(|(code, message)| Message::Error(ErrorPayload { code, message })),
        (arb_command_kind(), prop::collection::vec("[a-zA-Z0-9_]{1,24}".prop_map(String::from), 0..4))
            .prop_map(|(kind, args)| Message::Command(CommandPayload { kind, args })),
    ]
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn roundtrip_arbitrary_message(msg in arb_message()) {
        let encoded = Codec::encode(&msg).unwrap();
        let decoded = Codec::decode_slice(&encoded).unwrap().unwrap();
        prop_assert_eq!(msg, decoded);
    }

    #[test]
    fn length_prefix_matches_payload(msg in arb_message()) {
        let encoded = Codec::encode(&msg).unwrap();
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        prop_assert_eq!(len, encoded.len() - FRAME_HEADER_LEN);
    }

    #[test]
    fn decode_never_panics_on_garbage(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let mut buf = BytesMut::from(&data[..]);
        let _ = Codec::decode(&mut buf);
    }

    #[test]
    fn truncated_frames_never_consume(msg in arb_message(), cut in 1usize..16) {
        let encoded = Codec::encode(&msg).unwrap();
        let keep = encoded.len().saturating_sub(cut);
        let mut buf = BytesMut::from(&encoded[..keep]);
        let before = buf.len();
        if Codec::decode(&mut buf).unwrap().is_none() {
            prop_assert_eq!(buf.len(), before);
        }
    }
}
