//! Warp: one named shared-terminal session.
//!
//! A warp binds exactly one host to any number of shell clients. The host
//! handler applies host updates atomically (window size, mode merge, PTY
//! output), publishes coalesced state snapshots, and serves the host's
//! authorize/revoke control path. The client handler registers a
//! subscriber and feeds its keystrokes into the input collector.
//!
//! User-table mutation happens under a plain mutex with no suspension
//! points; all sends happen after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use warp_core::constants::INPUT_FORWARD_CHUNK;
use warp_core::protocol::{
    CommandKind, CommandPayload, HostUpdatePayload, Message, Mode, SessionState, UserState,
    UserToken, WarpId, WindowSize, error_code,
};

use crate::broadcast::{Broadcaster, OutboundFrame};
use crate::collector::{InputChunk, InputCollector};
use crate::session::{FrameReader, Session};

// =============================================================================
// Warp
// =============================================================================

struct WarpState {
    window_size: WindowSize,
    users: HashMap<UserToken, UserState>,
    /// Registration records for connected client sessions, used to make
    /// client teardown safe against token-reuse replacement.
    clients: HashMap<UserToken, Arc<Session>>,
    disconnected: bool,
}

/// A live warp: host slot, user table, output fan-out, input fan-in.
pub struct Warp {
    id: WarpId,
    state: StdMutex<WarpState>,
    broadcaster: Broadcaster,
    collector: InputCollector,
    host: StdMutex<Option<Arc<Session>>>,
}

impl Warp {
    /// Create a warp with the window size from the host's initial update.
    /// Returns the warp and the receiver drained by the input forward loop.
    pub fn new(id: WarpId, window_size: WindowSize) -> (Arc<Self>, mpsc::Receiver<InputChunk>) {
        let (collector, input_rx) = InputCollector::new();
        let warp = Arc::new(Self {
            id,
            state: StdMutex::new(WarpState {
                window_size,
                users: HashMap::new(),
                clients: HashMap::new(),
                disconnected: false,
            }),
            broadcaster: Broadcaster::new(),
            collector,
            host: StdMutex::new(None),
        });
        (warp, input_rx)
    }

    pub fn id(&self) -> &WarpId {
        &self.id
    }

    /// Current mode for a token; empty once the user is gone.
    fn mode_of(&self, token: &UserToken) -> Mode {
        let state = self.state.lock().expect("warp state lock poisoned");
        state
            .users
            .get(token)
            .map(|u| u.mode)
            .unwrap_or(Mode::empty())
    }

    fn window_size(&self) -> WindowSize {
        self.state.lock().expect("warp state lock poisoned").window_size
    }

    /// Build a snapshot from locked state: host first, then clients in a
    /// stable order.
    fn snapshot_locked(state: &WarpState, id: &WarpId) -> SessionState {
        let mut users: Vec<UserState> = state.users.values().cloned().collect();
        users.sort_by(|a, b| {
            b.hosting
                .cmp(&a.hosting)
                .then_with(|| a.username.cmp(&b.username))
                .then_with(|| a.token.as_str().cmp(b.token.as_str()))
        });
        SessionState {
            warp: id.clone(),
            window_size: state.window_size,
            users,
            disconnected: state.disconnected,
        }
    }

    fn snapshot(&self) -> SessionState {
        let state = self.state.lock().expect("warp state lock poisoned");
        Self::snapshot_locked(&state, &self.id)
    }

    /// Push a snapshot to every client and echo it to the host.
    async fn publish(&self, snapshot: SessionState) {
        self.broadcaster
            .broadcast(OutboundFrame::State(snapshot.clone()));

        let host = self
            .host
            .lock()
            .expect("host slot lock poisoned")
            .clone();
        if let Some(host) = host {
            // A failed echo surfaces in the host read loop; nothing to do
            // here.
            let _ = host.send(&Message::State(snapshot)).await;
        }
    }

    // =========================================================================
    // Host handler
    // =========================================================================

    /// Run the host side of the warp until the host session ends, then
    /// drain: final disconnected snapshot, close all clients.
    pub async fn handle_host(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut reader: FrameReader,
        input_rx: mpsc::Receiver<InputChunk>,
        initial: HostUpdatePayload,
    ) {
        info!(warp = %self.id, peer = %session.peer_addr(), token = %session.token(), "Host connected");

        {
            let mut state = self.state.lock().expect("warp state lock poisoned");
            state.users.insert(
                session.token().clone(),
                UserState {
                    token: session.token().clone(),
                    username: session.username().to_string(),
                    mode: Mode::SHELL_READ.union(Mode::SHELL_WRITE),
                    hosting: true,
                },
            );
        }
        *self.host.lock().expect("host slot lock poisoned") = Some(Arc::clone(&session));

        let forward = tokio::spawn(run_input_forward(
            Arc::clone(self),
            Arc::clone(&session),
            input_rx,
        ));

        self.publish(self.snapshot()).await;

        // The initial update's window size seeded the warp; its modes and
        // data still need applying.
        if !initial.modes.is_empty() || !initial.data.is_empty() {
            self.apply_update(initial).await;
        }

        loop {
            match reader.next().await {
                Ok(Message::HostUpdate(update)) => self.apply_update(update).await,
                Ok(Message::Command(cmd)) => self.apply_command(cmd, &session).await,
                Ok(other) => {
                    warn!(warp = %self.id, msg = ?other, "Unexpected message from host");
                    session
                        .send_error(
                            error_code::INTERNAL_ERROR,
                            "Unexpected message for a host session.",
                        )
                        .await;
                    break;
                }
                Err(e) => {
                    if !e.is_disconnect() {
                        warn!(warp = %self.id, error = %e, "Host session error");
                        if let Some(code) = e.wire_code() {
                            session.send_error(code, e.to_string()).await;
                        }
                    }
                    break;
                }
            }
        }

        self.drain().await;
        forward.abort();
        session.teardown().await;
        info!(warp = %self.id, "Host disconnected, warp drained");
    }

    /// Apply one host update atomically: window size, mode merge, output.
    /// A snapshot reflecting any change is published before the update's
    /// own output is broadcast.
    async fn apply_update(&self, update: HostUpdatePayload) {
        let (changed, window_size) = {
            let mut state = self.state.lock().expect("warp state lock poisoned");
            let mut dirty = false;

            if update.window_size != state.window_size {
                state.window_size = update.window_size;
                dirty = true;
            }

            // Merge semantics: tokens absent from the map stay untouched,
            // host entries are never overridden.
            for (token, mode) in &update.modes {
                if let Some(user) = state.users.get_mut(token) {
                    if !user.hosting && user.mode != *mode {
                        user.mode = *mode;
                        dirty = true;
                    }
                }
            }

            (
                dirty.then(|| Self::snapshot_locked(&state, &self.id)),
                state.window_size,
            )
        };

        if let Some(snapshot) = changed {
            self.publish(snapshot).await;
        }

        if !update.data.is_empty() {
            self.broadcaster.broadcast(OutboundFrame::Output {
                window_size,
                data: update.data,
            });
        }
    }

    /// Handle a host control command. Only the host session ever reaches
    /// this: the dispatch in the host read loop is the structural role
    /// check.
    async fn apply_command(&self, cmd: CommandPayload, session: &Arc<Session>) {
        match cmd.kind {
            CommandKind::State => {
                self.publish(self.snapshot()).await;
            }
            CommandKind::Authorize | CommandKind::Revoke => {
                if cmd.kind == CommandKind::Authorize && cmd.args.is_empty() {
                    session
                        .send_error(
                            error_code::INVALID_COMMAND,
                            "authorize requires a username or token.",
                        )
                        .await;
                    return;
                }

                let outcome = {
                    let mut state = self.state.lock().expect("warp state lock poisoned");

                    let targets = if cmd.args.is_empty() {
                        // Empty revoke strips write access from every
                        // non-host user.
                        Ok(state
                            .users
                            .values()
                            .filter(|u| !u.hosting)
                            .map(|u| u.token.clone())
                            .collect::<Vec<_>>())
                    } else {
                        resolve_args(&state, &cmd.args)
                    };

                    match targets {
                        Ok(tokens) => {
                            for token in &tokens {
                                if let Some(user) = state.users.get_mut(token) {
                                    match cmd.kind {
                                        CommandKind::Authorize => {
                                            user.mode.insert(Mode::SHELL_WRITE)
                                        }
                                        CommandKind::Revoke => user.mode.remove(Mode::SHELL_WRITE),
                                        CommandKind::State => unreachable!(),
                                    }
                                }
                            }
                            Ok(Self::snapshot_locked(&state, &self.id))
                        }
                        Err(arg) => Err(arg),
                    }
                };

                match outcome {
                    // Publish even when nothing changed: the command's
                    // effect must be observable as one snapshot.
                    Ok(snapshot) => {
                        info!(warp = %self.id, kind = ?cmd.kind, args = ?cmd.args, "Applied host command");
                        self.publish(snapshot).await;
                    }
                    Err(arg) => {
                        debug!(warp = %self.id, arg, "Host command argument did not match");
                        session
                            .send_error(
                                error_code::INVALID_COMMAND,
                                format!("Username or token not found: {arg}."),
                            )
                            .await;
                    }
                }
            }
        }
    }

    /// Host exit: mark disconnected, publish one final snapshot, close
    /// every client session.
    async fn drain(&self) {
        let final_snapshot = {
            let mut state = self.state.lock().expect("warp state lock poisoned");
            state.disconnected = true;
            state.clients.clear();
            Self::snapshot_locked(&state, &self.id)
        };
        *self.host.lock().expect("host slot lock poisoned") = None;
        self.broadcaster.close(final_snapshot);
    }

    // =========================================================================
    // Client handler
    // =========================================================================

    /// Run the client side: admission, subscription, input read loop,
    /// removal.
    pub async fn handle_client(self: &Arc<Self>, session: Arc<Session>, mut reader: FrameReader) {
        let token = session.token().clone();

        enum Admission {
            Ok,
            Draining,
            /// The submitted token belongs to the host.
            TokenTaken,
        }

        let admitted = {
            let mut state = self.state.lock().expect("warp state lock poisoned");
            if state.disconnected {
                Admission::Draining
            } else if state.users.get(&token).is_some_and(|u| u.hosting) {
                Admission::TokenTaken
            } else {
                state.users.insert(
                    token.clone(),
                    UserState {
                        token: token.clone(),
                        username: session.username().to_string(),
                        mode: Mode::SHELL_READ,
                        hosting: false,
                    },
                );
                state.clients.insert(token.clone(), Arc::clone(&session));
                Admission::Ok
            }
        };

        match admitted {
            Admission::Ok => {}
            Admission::Draining => {
                session
                    .send_error(
                        error_code::WARP_UNKNOWN,
                        format!(
                            "The warp you attempted to connect does not exist: {}.",
                            self.id
                        ),
                    )
                    .await;
                session.teardown().await;
                return;
            }
            Admission::TokenTaken => {
                session
                    .send_error(
                        error_code::INTERNAL_ERROR,
                        format!("The token you submitted is already in use: {token}."),
                    )
                    .await;
                session.teardown().await;
                return;
            }
        }

        info!(warp = %self.id, peer = %session.peer_addr(), token = %token, "Client joined");

        self.broadcaster.subscribe(token.clone(), Arc::clone(&session));
        self.publish(self.snapshot()).await;

        let input = self.collector.client_handle(token.clone());
        loop {
            match reader.next().await {
                Ok(Message::ClientUpdate(update)) => {
                    if input.offer(update.data).await.is_err() {
                        break;
                    }
                }
                Ok(other) => {
                    warn!(warp = %self.id, token = %token, msg = ?other, "Unexpected message from client");
                    session
                        .send_error(
                            error_code::INTERNAL_ERROR,
                            "Unexpected message for a client session.",
                        )
                        .await;
                    break;
                }
                Err(e) => {
                    if !e.is_disconnect() {
                        warn!(warp = %self.id, token = %token, error = %e, "Client session error");
                        if let Some(code) = e.wire_code() {
                            session.send_error(code, e.to_string()).await;
                        }
                    }
                    break;
                }
            }
        }

        // Remove ourselves unless the warp is draining (close handled the
        // roster) or a reconnect under the same token replaced us.
        let snapshot = {
            let mut state = self.state.lock().expect("warp state lock poisoned");
            let still_ours = state
                .clients
                .get(&token)
                .is_some_and(|s| Arc::ptr_eq(s, &session));
            if state.disconnected || !still_ours {
                None
            } else {
                state.users.remove(&token);
                state.clients.remove(&token);
                Some(Self::snapshot_locked(&state, &self.id))
            }
        };

        if snapshot.is_some() {
            self.broadcaster.unsubscribe(&token);
        }
        session.teardown().await;
        if let Some(snapshot) = snapshot {
            self.publish(snapshot).await;
        }

        info!(warp = %self.id, token = %token, "Client left");
    }
}

/// Resolve command arguments against connected non-host users, by username
/// or token. All-or-nothing: the first unmatched argument aborts.
fn resolve_args(
    state: &WarpState,
    args: &[String],
) -> std::result::Result<Vec<UserToken>, String> {
    let mut targets = Vec::with_capacity(args.len());
    for arg in args {
        match state
            .users
            .values()
            .find(|u| !u.hosting && (u.username == *arg || u.token.as_str() == *arg))
        {
            Some(user) => targets.push(user.token.clone()),
            None => return Err(arg.clone()),
        }
    }
    Ok(targets)
}

/// Forward collected client input to the host.
///
/// The write-mode check happens here, at dequeue time: a chunk buffered
/// before a revoke is dropped once the revoke lands, closing the race
/// between a policy change and the drain of pre-buffered input.
async fn run_input_forward(
    warp: Arc<Warp>,
    host: Arc<Session>,
    mut input_rx: mpsc::Receiver<InputChunk>,
) {
    'forward: while let Some(chunk) = input_rx.recv().await {
        if !warp.mode_of(&chunk.token).contains(Mode::SHELL_WRITE) {
            debug!(warp = %warp.id, token = %chunk.token, "Dropping input from non-writable client");
            continue;
        }

        // Re-framed in pieces: the delivery frame carries more than the
        // client's, so a near-cap input frame must not be forwarded whole.
        for piece in chunk.data.chunks(INPUT_FORWARD_CHUNK) {
            let update = HostUpdatePayload {
                from: Some(chunk.token.clone()),
                window_size: warp.window_size(),
                modes: HashMap::new(),
                data: piece.to_vec(),
            };
            if host.send(&Message::HostUpdate(update)).await.is_err() {
                break 'forward;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
