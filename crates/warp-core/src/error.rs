//! Error types for warp-core.

use thiserror::Error;

use crate::protocol::error_code;

/// Main error type for warp operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec error during encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Protocol violation or message unexpected for the session role.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The warp a host attempted to open already exists.
    #[error("warp already in use: {0}")]
    WarpInUse(String),

    /// The warp a client attempted to join does not exist.
    #[error("warp unknown: {0}")]
    WarpUnknown(String),

    /// A subscriber's delivery queue overflowed and it was evicted.
    #[error("subscriber too slow")]
    SlowConsumer,

    /// Connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// TLS configuration or handshake error.
    #[error("tls error: {message}")]
    Tls { message: String },
}

impl Error {
    /// The stable wire code for errors that are reported to the peer,
    /// or `None` for errors that only terminate the session locally.
    pub fn wire_code(&self) -> Option<&'static str> {
        match self {
            Error::WarpInUse(_) => Some(error_code::WARP_IN_USE),
            Error::WarpUnknown(_) => Some(error_code::WARP_UNKNOWN),
            Error::SlowConsumer => Some(error_code::SLOW_CONSUMER),
            Error::Codec { .. } | Error::Protocol { .. } => Some(error_code::INTERNAL_ERROR),
            _ => None,
        }
    }

    /// Returns true if this error is an ordinary peer disconnect rather
    /// than a fault worth reporting.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::Io(_))
    }
}

/// Convenience result type for warp operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_codec() {
        let err = Error::Codec {
            message: "frame too large".into(),
        };
        assert_eq!(err.to_string(), "codec error: frame too large");
    }

    #[test]
    fn error_display_warp_in_use() {
        let err = Error::WarpInUse("alpha".into());
        assert_eq!(err.to_string(), "warp already in use: alpha");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(Error::WarpInUse("a".into()).wire_code(), Some("warp_in_use"));
        assert_eq!(
            Error::WarpUnknown("a".into()).wire_code(),
            Some("warp_unknown")
        );
        assert_eq!(Error::SlowConsumer.wire_code(), Some("slow_consumer"));
        assert_eq!(
            Error::Protocol {
                message: "bad".into()
            }
            .wire_code(),
            Some("internal_error")
        );
        assert_eq!(Error::Timeout.wire_code(), None);
        assert_eq!(Error::ConnectionClosed.wire_code(), None);
    }

    #[test]
    fn disconnect_classification() {
        assert!(Error::ConnectionClosed.is_disconnect());
        assert!(
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset"
            ))
            .is_disconnect()
        );
        assert!(!Error::Timeout.is_disconnect());
        assert!(!Error::WarpInUse("a".into()).is_disconnect());
    }
}
