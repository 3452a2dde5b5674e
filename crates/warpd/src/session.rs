//! Session handling for one duplex connection.
//!
//! A [`Session`] is created from a freshly accepted connection once its
//! hello frame has been read and its role, warp, and identity are fixed.
//! Writes are serialized by a per-session lock so frames stay atomic on the
//! wire; reads flow through the [`FrameReader`] owned by the role handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use warp_core::constants::{HELLO_TIMEOUT, PROTOCOL_VERSION, TEARDOWN_FLUSH_TIMEOUT};
use warp_core::error::{Error, Result};
use warp_core::protocol::{
    Codec, ErrorPayload, HelloPayload, Message, SessionType, UserToken, WarpId, error_code,
};

/// Boxed read half of a session's transport (TCP or TLS).
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a session's transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// =============================================================================
// FrameReader
// =============================================================================

/// Decodes length-prefixed frames from a session's read half.
///
/// Owned by the role handler rather than the [`Session`] so the read loop
/// needs no lock. Cancelling the session aborts any pending read.
pub struct FrameReader {
    read: BoxedReader,
    buf: BytesMut,
    cancel: watch::Receiver<bool>,
}

impl FrameReader {
    fn new(read: BoxedReader, cancel: watch::Receiver<bool>) -> Self {
        Self {
            read,
            buf: BytesMut::with_capacity(8 * 1024),
            cancel,
        }
    }

    /// Read the next frame, or an error on disconnect, cancellation, or a
    /// malformed/oversized frame.
    pub async fn next(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = Codec::decode(&mut self.buf)? {
                return Ok(msg);
            }

            tokio::select! {
                _ = cancelled(&mut self.cancel) => {
                    return Err(Error::ConnectionClosed);
                }
                read = self.read.read_buf(&mut self.buf) => {
                    if read? == 0 {
                        return Err(Error::ConnectionClosed);
                    }
                }
            }
        }
    }
}

/// Resolve once the cancellation flag flips to true.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling; stay pending.
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// One authenticated connection, host or shell-client.
///
/// Role, warp, token, and username are fixed at hello time. The session can
/// be shared across tasks; `send` keeps frames atomic and `teardown` is
/// idempotent.
pub struct Session {
    session_type: SessionType,
    warp: WarpId,
    token: UserToken,
    username: String,
    peer_addr: SocketAddr,
    writer: AsyncMutex<BoxedWriter>,
    cancel_tx: watch::Sender<bool>,
    torn_down: AtomicBool,
}

impl Session {
    /// Perform session admission on a fresh connection: read exactly one
    /// hello within [`HELLO_TIMEOUT`], issue a token if the peer lacks one,
    /// and hand back the session plus its frame reader.
    pub async fn accept(
        read: BoxedReader,
        mut write: BoxedWriter,
        peer_addr: SocketAddr,
    ) -> Result<(Arc<Self>, FrameReader)> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut reader = FrameReader::new(read, cancel_rx);

        let hello = match timeout(HELLO_TIMEOUT, reader.next()).await {
            Ok(Ok(Message::Hello(hello))) => hello,
            Ok(Ok(other)) => {
                send_raw_error(
                    &mut write,
                    error_code::INTERNAL_ERROR,
                    "Expected a hello as the first frame.",
                )
                .await;
                return Err(Error::Protocol {
                    message: format!("expected Hello, got {other:?}"),
                });
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Timeout),
        };

        if hello.protocol_version != PROTOCOL_VERSION {
            send_raw_error(
                &mut write,
                error_code::INTERNAL_ERROR,
                format!("Unsupported protocol version: {}.", hello.protocol_version),
            )
            .await;
            return Err(Error::Protocol {
                message: format!("unsupported protocol version: {}", hello.protocol_version),
            });
        }

        let token = issue_token(&hello);

        debug!(
            peer = %peer_addr,
            warp = %hello.warp,
            session_type = ?hello.session_type,
            token = %token,
            username = %hello.username,
            "Session admitted"
        );

        let session = Arc::new(Self {
            session_type: hello.session_type,
            warp: hello.warp,
            token,
            username: hello.username,
            peer_addr,
            writer: AsyncMutex::new(write),
            cancel_tx,
            torn_down: AtomicBool::new(false),
        });

        Ok((session, reader))
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn warp(&self) -> &WarpId {
        &self.warp
    }

    pub fn token(&self) -> &UserToken {
        &self.token
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Serialize and write one frame. Atomic across frame boundaries: the
    /// per-session write lock is held for the whole frame.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let encoded = Codec::encode(msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Best-effort coded error frame, bounded by the teardown flush
    /// deadline. Failures are logged and swallowed.
    pub async fn send_error(&self, code: &str, message: impl Into<String>) {
        let msg = Message::Error(ErrorPayload::new(code, message));
        match timeout(TEARDOWN_FLUSH_TIMEOUT, self.send(&msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_disconnect() => {}
            Ok(Err(e)) => debug!(peer = %self.peer_addr, error = %e, "Failed to send error frame"),
            Err(_) => debug!(peer = %self.peer_addr, code, "Error frame write timed out"),
        }
    }

    /// True once `teardown` has run.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Cancel the session and release the connection.
    ///
    /// Idempotent. Aborts pending reads, then flushes and shuts the write
    /// half best-effort within [`TEARDOWN_FLUSH_TIMEOUT`].
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.cancel_tx.send(true);

        match timeout(TEARDOWN_FLUSH_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        })
        .await
        {
            Ok(()) => {}
            Err(_) => warn!(peer = %self.peer_addr, "Session write flush timed out"),
        }

        debug!(peer = %self.peer_addr, warp = %self.warp, "Session torn down");
    }
}

fn issue_token(hello: &HelloPayload) -> UserToken {
    match hello.token.as_ref().filter(|t| !t.as_str().is_empty()) {
        Some(token) => token.clone(),
        None => match hello.session_type {
            SessionType::Host => UserToken::generate_host(),
            SessionType::ShellClient => UserToken::generate_guest(),
        },
    }
}

/// Write an error frame on a connection that has no session yet.
async fn send_raw_error(write: &mut BoxedWriter, code: &str, message: impl Into<String>) {
    let msg = Message::Error(ErrorPayload::new(code, message));
    if let Ok(encoded) = Codec::encode(&msg) {
        let _ = timeout(TEARDOWN_FLUSH_TIMEOUT, async {
            let _ = write.write_all(&encoded).await;
            let _ = write.flush().await;
        })
        .await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn split_boxed(
        io: tokio::io::DuplexStream,
    ) -> (BoxedReader, BoxedWriter) {
        let (read, write) = tokio::io::split(io);
        (Box::new(read), Box::new(write))
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4242".parse().unwrap()
    }

    fn client_hello(token: Option<&str>) -> Message {
        Message::Hello(HelloPayload {
            protocol_version: PROTOCOL_VERSION,
            session_type: SessionType::ShellClient,
            warp: WarpId::new("alpha"),
            username: "goofy".into(),
            token: token.map(UserToken::new),
        })
    }

    #[tokio::test]
    async fn accept_issues_guest_token() {
        let (server_io, client_io) = duplex(64 * 1024);
        let (read, write) = split_boxed(server_io);
        let (mut peer_write, _peer_read) = {
            let (r, w) = tokio::io::split(client_io);
            (w, r)
        };

        let encoded = Codec::encode(&client_hello(None)).unwrap();
        peer_write.write_all(&encoded).await.unwrap();

        let (session, _reader) = Session::accept(read, write, peer()).await.unwrap();
        assert_eq!(session.session_type(), SessionType::ShellClient);
        assert_eq!(session.warp().as_str(), "alpha");
        assert!(session.token().as_str().starts_with("guest_"));
        assert_eq!(session.username(), "goofy");
    }

    #[tokio::test]
    async fn accept_preserves_submitted_token() {
        let (server_io, client_io) = duplex(64 * 1024);
        let (read, write) = split_boxed(server_io);
        let (mut peer_read, mut peer_write) = {
            let (r, w) = tokio::io::split(client_io);
            (r, w)
        };

        let encoded = Codec::encode(&client_hello(Some("guest_JpJP50EIas9cOfwo"))).unwrap();
        peer_write.write_all(&encoded).await.unwrap();

        let (session, _reader) = Session::accept(read, write, peer()).await.unwrap();
        assert_eq!(session.token().as_str(), "guest_JpJP50EIas9cOfwo");

        // Reader stays quiet; nothing else was sent.
        let mut probe = [0u8; 1];
        let pending = timeout(
            std::time::Duration::from_millis(50),
            peer_read.read(&mut probe),
        )
        .await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn accept_rejects_non_hello_first_frame() {
        let (server_io, client_io) = duplex(64 * 1024);
        let (read, write) = split_boxed(server_io);
        let (mut peer_read, mut peer_write) = {
            let (r, w) = tokio::io::split(client_io);
            (r, w)
        };

        let msg = Message::ClientUpdate(warp_core::protocol::ClientUpdatePayload {
            data: b"ls\n".to_vec(),
        });
        peer_write
            .write_all(&Codec::encode(&msg).unwrap())
            .await
            .unwrap();

        let err = Session::accept(read, write, peer()).await.err().unwrap();
        assert!(matches!(err, Error::Protocol { .. }));

        // The peer receives one internal_error frame.
        let mut buf = BytesMut::new();
        let frame = loop {
            if let Some(msg) = Codec::decode(&mut buf).unwrap() {
                break msg;
            }
            peer_read.read_buf(&mut buf).await.unwrap();
        };
        match frame {
            Message::Error(e) => assert_eq!(e.code, error_code::INTERNAL_ERROR),
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accept_rejects_version_mismatch() {
        let (server_io, client_io) = duplex(64 * 1024);
        let (read, write) = split_boxed(server_io);
        let (_peer_read, mut peer_write) = {
            let (r, w) = tokio::io::split(client_io);
            (r, w)
        };

        let msg = Message::Hello(HelloPayload {
            protocol_version: PROTOCOL_VERSION + 1,
            session_type: SessionType::Host,
            warp: WarpId::new("alpha"),
            username: "mickey".into(),
            token: None,
        });
        peer_write
            .write_all(&Codec::encode(&msg).unwrap())
            .await
            .unwrap();

        let err = Session::accept(read, write, peer()).await.err().unwrap();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_cancels_reads() {
        let (server_io, client_io) = duplex(64 * 1024);
        let (read, write) = split_boxed(server_io);
        let (_peer_read, mut peer_write) = {
            let (r, w) = tokio::io::split(client_io);
            (r, w)
        };

        peer_write
            .write_all(&Codec::encode(&client_hello(None)).unwrap())
            .await
            .unwrap();

        let (session, mut reader) = Session::accept(read, write, peer()).await.unwrap();

        let read_task = tokio::spawn(async move { reader.next().await });

        session.teardown().await;
        session.teardown().await;
        assert!(session.is_torn_down());

        let result = read_task.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }
}
