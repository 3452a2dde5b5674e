//! Test support for warpd: an in-process peer that speaks the framed wire
//! protocol over TCP, acting as either a host or a shell client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use warp_core::constants::PROTOCOL_VERSION;
use warp_core::error::{Error, Result};
use warp_core::protocol::{
    ClientUpdatePayload, Codec, CommandKind, CommandPayload, ErrorPayload, HelloPayload,
    HostUpdatePayload, Message, Mode, SessionState, SessionType, UserToken, WarpId, WindowSize,
};

/// Frame receive deadline for tests.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A protocol peer connected to a warpd instance.
pub struct TestPeer {
    stream: TcpStream,
    buf: BytesMut,
    window_size: WindowSize,
}

impl TestPeer {
    /// Connect without sending a hello; used for malformed-handshake tests.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
            window_size: WindowSize::default(),
        })
    }

    /// Connect as a host: hello plus the initial update carrying the
    /// window size.
    pub async fn host(
        addr: SocketAddr,
        warp: &str,
        username: &str,
        window_size: WindowSize,
    ) -> Result<Self> {
        let mut peer = Self::connect(addr).await?;
        peer.window_size = window_size;
        peer.send(&Message::Hello(HelloPayload {
            protocol_version: PROTOCOL_VERSION,
            session_type: SessionType::Host,
            warp: WarpId::new(warp),
            username: username.to_string(),
            token: None,
        }))
        .await?;
        peer.send(&Message::HostUpdate(HostUpdatePayload {
            from: None,
            window_size,
            modes: HashMap::new(),
            data: Vec::new(),
        }))
        .await?;
        Ok(peer)
    }

    /// Connect as a shell client, optionally resubmitting a token.
    pub async fn join(
        addr: SocketAddr,
        warp: &str,
        username: &str,
        token: Option<UserToken>,
    ) -> Result<Self> {
        let mut peer = Self::connect(addr).await?;
        peer.send(&Message::Hello(HelloPayload {
            protocol_version: PROTOCOL_VERSION,
            session_type: SessionType::ShellClient,
            warp: WarpId::new(warp),
            username: username.to_string(),
            token,
        }))
        .await?;
        Ok(peer)
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let encoded = Codec::encode(msg)?;
        self.stream.write_all(&encoded).await?;
        Ok(())
    }

    /// Write raw bytes, bypassing the codec; used for frame-cap tests.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Receive the next frame within [`RECV_TIMEOUT`].
    pub async fn recv(&mut self) -> Result<Message> {
        timeout(RECV_TIMEOUT, async {
            loop {
                if let Some(msg) = Codec::decode(&mut self.buf)? {
                    return Ok(msg);
                }
                let read = self.stream.read_buf(&mut self.buf).await?;
                if read == 0 {
                    return Err(Error::ConnectionClosed);
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout)?
    }

    /// Receive frames until the next state snapshot.
    pub async fn recv_state(&mut self) -> Result<SessionState> {
        loop {
            match self.recv().await? {
                Message::State(state) => return Ok(state),
                _ => continue,
            }
        }
    }

    /// Receive state snapshots until one matches the predicate.
    pub async fn state_where(
        &mut self,
        pred: impl Fn(&SessionState) -> bool,
    ) -> Result<SessionState> {
        loop {
            let state = self.recv_state().await?;
            if pred(&state) {
                return Ok(state);
            }
        }
    }

    /// Receive frames until the next output chunk.
    pub async fn recv_output(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.recv().await? {
                Message::HostUpdate(update) if !update.data.is_empty() => return Ok(update.data),
                Message::State(_) | Message::HostUpdate(_) => continue,
                other => {
                    return Err(Error::Protocol {
                        message: format!("unexpected frame while awaiting output: {other:?}"),
                    });
                }
            }
        }
    }

    /// Accumulate output chunks until exactly `len` bytes have arrived.
    pub async fn recv_output_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut collected = Vec::with_capacity(len);
        while collected.len() < len {
            collected.extend_from_slice(&self.recv_output().await?);
        }
        Ok(collected)
    }

    /// Receive frames until the next error frame.
    pub async fn recv_error(&mut self) -> Result<ErrorPayload> {
        loop {
            match self.recv().await? {
                Message::Error(error) => return Ok(error),
                _ => continue,
            }
        }
    }

    /// Receive frames until the next input delivery (host side), returning
    /// the originating token and the bytes.
    pub async fn recv_input(&mut self) -> Result<(UserToken, Vec<u8>)> {
        loop {
            match self.recv().await? {
                Message::HostUpdate(update) => {
                    if let Some(from) = update.from {
                        return Ok((from, update.data));
                    }
                }
                _ => continue,
            }
        }
    }

    /// Host: push PTY output.
    pub async fn send_output(&mut self, data: &[u8]) -> Result<()> {
        let window_size = self.window_size;
        self.send(&Message::HostUpdate(HostUpdatePayload {
            from: None,
            window_size,
            modes: HashMap::new(),
            data: data.to_vec(),
        }))
        .await
    }

    /// Host: push a window resize (optionally with trailing output).
    pub async fn send_resize(&mut self, window_size: WindowSize) -> Result<()> {
        self.window_size = window_size;
        self.send(&Message::HostUpdate(HostUpdatePayload {
            from: None,
            window_size,
            modes: HashMap::new(),
            data: Vec::new(),
        }))
        .await
    }

    /// Host: push a mode merge.
    pub async fn send_modes(&mut self, modes: HashMap<UserToken, Mode>) -> Result<()> {
        let window_size = self.window_size;
        self.send(&Message::HostUpdate(HostUpdatePayload {
            from: None,
            window_size,
            modes,
            data: Vec::new(),
        }))
        .await
    }

    /// Host: submit a control command.
    pub async fn send_command(&mut self, kind: CommandKind, args: Vec<String>) -> Result<()> {
        self.send(&Message::Command(CommandPayload { kind, args }))
            .await
    }

    /// Client: submit input keystrokes.
    pub async fn send_input(&mut self, data: &[u8]) -> Result<()> {
        self.send(&Message::ClientUpdate(ClientUpdatePayload {
            data: data.to_vec(),
        }))
        .await
    }

    /// Close the write half, signalling a clean disconnect.
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Find the snapshot entry for a non-host user by username.
pub fn find_user<'a>(state: &'a SessionState, username: &str) -> Option<&'a warp_core::protocol::UserState> {
    state
        .users
        .iter()
        .find(|u| !u.hosting && u.username == username)
}
