//! Warp registry and connection listener.
//!
//! The registry mutex is held only across lookup+insert during host
//! admission and lookup+delete during warp teardown; all hot-path traffic
//! operates on the warp object directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use warp_core::error::Result;
use warp_core::protocol::{Message, SessionType, WarpId, error_code};

use crate::session::{BoxedReader, BoxedWriter, FrameReader, Session, cancelled};
use crate::warp::Warp;

type Registry = Arc<StdMutex<HashMap<WarpId, Arc<Warp>>>>;

/// Listener configuration.
#[derive(Clone)]
pub struct SrvConfig {
    pub listen_addr: SocketAddr,
    /// TLS acceptor when serving over TLS; plaintext TCP otherwise.
    pub tls: Option<TlsAcceptor>,
}

/// A running warpd server: one listener plus the process-wide warp
/// registry.
pub struct Srv {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    warps: Registry,
    shutdown_tx: watch::Sender<bool>,
}

impl Srv {
    /// Bind the listener. Bind failures are fatal to the daemon.
    pub async fn bind(config: SrvConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        info!(
            addr = %listener.local_addr()?,
            tls = config.tls.is_some(),
            "Listening"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            listener,
            tls: config.tls,
            warps: Arc::new(StdMutex::new(HashMap::new())),
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Signal the accept loop and every session to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Number of live warps (testing).
    pub fn warp_count(&self) -> usize {
        self.warps.lock().expect("registry lock poisoned").len()
    }

    /// Run the accept loop until `shutdown` is called.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = cancelled(&mut shutdown_rx) => {
                    info!("Listener stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let tls = self.tls.clone();
                            let warps = Arc::clone(&self.warps);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                handle_connection(stream, peer_addr, tls, warps, shutdown_rx)
                                    .await;
                            });
                        }
                        // Nothing was accepted; there is no connection to
                        // touch here. Log and keep serving.
                        Err(e) => {
                            warn!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        }
    }
}

// =============================================================================
// Connection handling
// =============================================================================

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    warps: Registry,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(peer = %peer_addr, "Handling new connection");

    let (read, write): (BoxedReader, BoxedWriter) = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let (read, write) = tokio::io::split(tls_stream);
                (Box::new(read), Box::new(write))
            }
            Err(e) => {
                debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                return;
            }
        },
        None => {
            let (read, write) = stream.into_split();
            (Box::new(read), Box::new(write))
        }
    };

    let (session, reader) = match Session::accept(read, write, peer_addr).await {
        Ok(pair) => pair,
        Err(e) => {
            if !e.is_disconnect() {
                debug!(peer = %peer_addr, error = %e, "Session admission failed");
            }
            return;
        }
    };

    // Daemon shutdown cancels the session, which aborts its reads; the
    // dispatched handler then unwinds normally (hosts drain their warp).
    let watcher = tokio::spawn({
        let session = Arc::clone(&session);
        async move {
            cancelled(&mut shutdown_rx).await;
            session.teardown().await;
        }
    });

    dispatch(&warps, Arc::clone(&session), reader).await;

    watcher.abort();
    session.teardown().await;
    debug!(peer = %peer_addr, "Done handling connection");
}

async fn dispatch(warps: &Registry, session: Arc<Session>, reader: FrameReader) {
    match session.session_type() {
        SessionType::Host => handle_host(warps, session, reader).await,
        SessionType::ShellClient => handle_client(warps, session, reader).await,
    }
}

/// Host admission: the initial host update carries the window size; the
/// registry insert is what claims the warp id.
async fn handle_host(warps: &Registry, session: Arc<Session>, mut reader: FrameReader) {
    let initial = match reader.next().await {
        Ok(Message::HostUpdate(update)) => update,
        Ok(other) => {
            warn!(peer = %session.peer_addr(), msg = ?other, "Expected an initial host update");
            session
                .send_error(
                    error_code::INTERNAL_ERROR,
                    "Expected an initial host update.",
                )
                .await;
            return;
        }
        Err(e) => {
            if !e.is_disconnect() {
                warn!(peer = %session.peer_addr(), error = %e, "Initial host update error");
                if let Some(code) = e.wire_code() {
                    session.send_error(code, e.to_string()).await;
                }
            }
            return;
        }
    };

    let warp_id = session.warp().clone();
    let created = {
        let mut registry = warps.lock().expect("registry lock poisoned");
        if registry.contains_key(&warp_id) {
            None
        } else {
            let (warp, input_rx) = Warp::new(warp_id.clone(), initial.window_size);
            registry.insert(warp_id.clone(), Arc::clone(&warp));
            Some((warp, input_rx))
        }
    };

    let Some((warp, input_rx)) = created else {
        warn!(warp = %warp_id, "Host error: warp already in use");
        session
            .send_error(
                error_code::WARP_IN_USE,
                format!("The warp you attempted to open is already in use: {warp_id}."),
            )
            .await;
        return;
    };

    warp.handle_host(session, reader, input_rx, initial).await;

    // The final disconnected snapshot has been published; the id is free
    // for reuse from here on.
    debug!(warp = %warp_id, "Cleaning up warp");
    warps.lock().expect("registry lock poisoned").remove(&warp_id);
}

async fn handle_client(warps: &Registry, session: Arc<Session>, reader: FrameReader) {
    let warp = {
        let registry = warps.lock().expect("registry lock poisoned");
        registry.get(session.warp()).cloned()
    };

    match warp {
        Some(warp) => warp.handle_client(session, reader).await,
        None => {
            warn!(warp = %session.warp(), "Client error: warp unknown");
            session
                .send_error(
                    error_code::WARP_UNKNOWN,
                    format!(
                        "The warp you attempted to connect does not exist: {}.",
                        session.warp()
                    ),
                )
                .await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
