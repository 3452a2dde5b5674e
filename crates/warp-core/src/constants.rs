//! Protocol and configuration constants for warp.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (1 MiB). Frames above this abort the session.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length of the random suffix in server-issued tokens.
pub const TOKEN_SUFFIX_LEN: usize = 16;

/// Token prefix for non-host users.
pub const GUEST_TOKEN_PREFIX: &str = "guest_";

/// Token prefix for hosts.
pub const HOST_TOKEN_PREFIX: &str = "host_";

// =============================================================================
// Timing Constants
// =============================================================================

/// How long a freshly accepted connection has to send its hello.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Best-effort write flush deadline during session teardown.
pub const TEARDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Fan-out / Fan-in Limits
// =============================================================================

/// Per-subscriber broadcast queue depth, in frames.
pub const SUBSCRIBER_QUEUE_FRAMES: usize = 256;

/// Per-subscriber broadcast queue budget, in payload bytes.
pub const SUBSCRIBER_QUEUE_BYTES: usize = 1024 * 1024;

/// Shared input-collector queue depth, in chunks.
pub const INPUT_QUEUE_CHUNKS: usize = 256;

/// Maximum buffered input chunks per client token.
pub const INPUT_PER_CLIENT_CHUNKS: usize = 32;

/// Largest input slice re-framed into one host delivery frame.
pub const INPUT_FORWARD_CHUNK: usize = 64 * 1024;

// =============================================================================
// Default Values
// =============================================================================

/// Default listen address (all interfaces, port 4242).
pub const DEFAULT_LISTEN_ADDR: &str = ":4242";

/// Default terminal columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal rows.
pub const DEFAULT_ROWS: u16 = 24;
