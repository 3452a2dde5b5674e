//! Output broadcaster: per-warp fan-out of PTY output and state snapshots.
//!
//! Every subscriber gets its own bounded queue drained by a dedicated
//! writer task. A subscriber that falls behind (queue full by frame count
//! or byte budget) is evicted with a `slow_consumer` error; the rest are
//! unaffected and the host is never blocked by a slow client.
//!
//! Delivery iterates a snapshot of the subscriber list; the producer only
//! takes the list lock to splice subscribers in and out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tracing::{debug, info};

use warp_core::constants::{SUBSCRIBER_QUEUE_BYTES, SUBSCRIBER_QUEUE_FRAMES};
use warp_core::protocol::{
    HostUpdatePayload, Message, SessionState, UserToken, WindowSize, error_code,
};

use crate::session::Session;

// =============================================================================
// Frames
// =============================================================================

/// A frame queued for delivery to one subscriber.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// PTY output chunk, shipped with the window size current at emission.
    Output {
        window_size: WindowSize,
        data: Vec<u8>,
    },
    /// Session state snapshot.
    State(SessionState),
}

impl OutboundFrame {
    /// Payload bytes counted against the subscriber's byte budget. State
    /// snapshots are small and only count against the frame budget.
    fn cost(&self) -> usize {
        match self {
            OutboundFrame::Output { data, .. } => data.len(),
            OutboundFrame::State(_) => 0,
        }
    }

    fn into_message(self) -> Message {
        match self {
            OutboundFrame::Output { window_size, data } => Message::HostUpdate(HostUpdatePayload {
                from: None,
                window_size,
                modes: HashMap::new(),
                data,
            }),
            OutboundFrame::State(state) => Message::State(state),
        }
    }
}

// =============================================================================
// Broadcaster
// =============================================================================

#[derive(Clone)]
struct Subscriber {
    token: UserToken,
    tx: mpsc::Sender<OutboundFrame>,
    queued_bytes: Arc<AtomicUsize>,
    session: Arc<Session>,
}

/// Fan-out of output and state frames to all of a warp's clients.
pub struct Broadcaster {
    subscribers: StdMutex<HashMap<UserToken, Subscriber>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: StdMutex::new(HashMap::new()),
        }
    }

    /// Register a subscriber and spawn its writer task. A subscriber
    /// already registered under the same token is replaced and torn down.
    pub fn subscribe(&self, token: UserToken, session: Arc<Session>) {
        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(SUBSCRIBER_QUEUE_FRAMES);
        let queued_bytes = Arc::new(AtomicUsize::new(0));

        let subscriber = Subscriber {
            token: token.clone(),
            tx,
            queued_bytes: Arc::clone(&queued_bytes),
            session: Arc::clone(&session),
        };

        let replaced = {
            let mut subs = self.subscribers.lock().expect("subscriber lock poisoned");
            subs.insert(token.clone(), subscriber)
        };
        if let Some(old) = replaced {
            debug!(token = %token, "Replacing existing subscriber");
            tokio::spawn(async move { old.session.teardown().await });
        }

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                queued_bytes.fetch_sub(frame.cost(), Ordering::SeqCst);
                if session.send(&frame.into_message()).await.is_err() {
                    break;
                }
            }
            // Sender dropped (unsubscribe, eviction, or warp teardown) or
            // the socket failed; either way the session is done.
            session.teardown().await;
        });
    }

    /// Remove a subscriber. Its writer task drains any queued frames and
    /// then tears the session down. Safe to call for unknown tokens.
    pub fn unsubscribe(&self, token: &UserToken) {
        let mut subs = self.subscribers.lock().expect("subscriber lock poisoned");
        subs.remove(token);
    }

    /// Deliver one frame to every subscriber, evicting any whose queue
    /// overflows.
    pub fn broadcast(&self, frame: OutboundFrame) {
        let snapshot: Vec<Subscriber> = {
            let subs = self.subscribers.lock().expect("subscriber lock poisoned");
            subs.values().cloned().collect()
        };

        let cost = frame.cost();
        let mut evicted = Vec::new();

        for sub in snapshot {
            let queued = sub.queued_bytes.fetch_add(cost, Ordering::SeqCst) + cost;
            if queued > SUBSCRIBER_QUEUE_BYTES {
                evicted.push(sub);
                continue;
            }

            match sub.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => evicted.push(sub),
                // Writer already gone; the owning handler cleans up.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        for sub in evicted {
            self.evict(sub);
        }
    }

    /// Publish the final disconnected snapshot and drop every subscriber.
    /// Writer tasks drain their queues (final state included) and then
    /// close their sessions.
    pub fn close(&self, final_state: SessionState) {
        let drained: Vec<Subscriber> = {
            let mut subs = self.subscribers.lock().expect("subscriber lock poisoned");
            subs.drain().map(|(_, sub)| sub).collect()
        };

        for sub in drained {
            let _ = sub.tx.try_send(OutboundFrame::State(final_state.clone()));
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber lock poisoned").len()
    }

    fn evict(&self, sub: Subscriber) {
        {
            let mut subs = self.subscribers.lock().expect("subscriber lock poisoned");
            // Only remove the entry if it is still the same subscriber; a
            // replacement under the same token must survive.
            if let Some(current) = subs.get(&sub.token) {
                if current.tx.same_channel(&sub.tx) {
                    subs.remove(&sub.token);
                }
            }
        }

        info!(token = %sub.token, "Evicting slow subscriber");
        tokio::spawn(async move {
            sub.session
                .send_error(
                    error_code::SLOW_CONSUMER,
                    "Your client is too slow to keep up with the warp output.",
                )
                .await;
            sub.session.teardown().await;
        });
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::time::{Duration, timeout};

    use warp_core::constants::PROTOCOL_VERSION;
    use warp_core::protocol::{Codec, HelloPayload, SessionType, WarpId};

    /// Peer end of a subscriber connection.
    struct PeerEnd {
        read: tokio::io::ReadHalf<tokio::io::DuplexStream>,
        buf: BytesMut,
    }

    impl PeerEnd {
        async fn next(&mut self) -> Message {
            loop {
                if let Some(msg) = Codec::decode(&mut self.buf).unwrap() {
                    return msg;
                }
                let n = self.read.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "peer connection closed");
            }
        }

        async fn next_output(&mut self) -> Vec<u8> {
            loop {
                match self.next().await {
                    Message::HostUpdate(update) => return update.data,
                    Message::State(_) => continue,
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        }
    }

    async fn subscriber(buffer: usize, token: &str) -> (Arc<Session>, PeerEnd) {
        let (server_io, client_io) = duplex(buffer);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (peer_read, mut peer_write) = tokio::io::split(client_io);

        let hello = Message::Hello(HelloPayload {
            protocol_version: PROTOCOL_VERSION,
            session_type: SessionType::ShellClient,
            warp: WarpId::new("alpha"),
            username: "goofy".into(),
            token: Some(UserToken::new(token)),
        });
        peer_write
            .write_all(&Codec::encode(&hello).unwrap())
            .await
            .unwrap();

        let (session, _reader) = Session::accept(
            Box::new(server_read),
            Box::new(server_write),
            "127.0.0.1:4242".parse().unwrap(),
        )
        .await
        .unwrap();

        (
            session,
            PeerEnd {
                read: peer_read,
                buf: BytesMut::new(),
            },
        )
    }

    fn output(data: &[u8]) -> OutboundFrame {
        OutboundFrame::Output {
            window_size: WindowSize::default(),
            data: data.to_vec(),
        }
    }

    fn state(disconnected: bool) -> SessionState {
        SessionState {
            warp: WarpId::new("alpha"),
            window_size: WindowSize::default(),
            users: Vec::new(),
            disconnected,
        }
    }

    #[tokio::test]
    async fn delivers_frames_in_order_to_all_subscribers() {
        let broadcaster = Broadcaster::new();
        let (s1, mut p1) = subscriber(64 * 1024, "guest_one").await;
        let (s2, mut p2) = subscriber(64 * 1024, "guest_two").await;

        broadcaster.subscribe(s1.token().clone(), s1.clone());
        broadcaster.subscribe(s2.token().clone(), s2.clone());
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.broadcast(output(b"one"));
        broadcaster.broadcast(OutboundFrame::State(state(false)));
        broadcaster.broadcast(output(b"two"));

        for peer in [&mut p1, &mut p2] {
            assert_eq!(peer.next_output().await, b"one");
            assert_eq!(peer.next_output().await, b"two");
        }
    }

    #[tokio::test]
    async fn state_after_output_is_seen_after_output() {
        let broadcaster = Broadcaster::new();
        let (s1, mut p1) = subscriber(64 * 1024, "guest_one").await;
        broadcaster.subscribe(s1.token().clone(), s1.clone());

        broadcaster.broadcast(output(b"chunk"));
        broadcaster.broadcast(OutboundFrame::State(state(false)));

        match p1.next().await {
            Message::HostUpdate(update) => assert_eq!(update.data, b"chunk"),
            other => panic!("expected output first, got {other:?}"),
        }
        match p1.next().await {
            Message::State(s) => assert!(!s.disconnected),
            other => panic!("expected state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_queue_evicts_only_the_slow_subscriber() {
        let broadcaster = Broadcaster::new();
        // Tiny transport buffer and an unread peer: the writer task blocks
        // on the first frame and the queue fills behind it.
        let (slow, _slow_peer) = subscriber(64, "guest_slow").await;
        let (fast, mut fast_peer) = subscriber(1024 * 1024, "guest_fast").await;

        broadcaster.subscribe(slow.token().clone(), slow.clone());
        broadcaster.subscribe(fast.token().clone(), fast.clone());

        // Yield between broadcasts so the fast writer keeps draining while
        // the slow queue backs up behind its blocked writer.
        let rounds = SUBSCRIBER_QUEUE_FRAMES + 10;
        for i in 0..rounds {
            broadcaster.broadcast(output(format!("chunk-{i}").as_bytes()));
            tokio::task::yield_now().await;
        }

        assert_eq!(broadcaster.subscriber_count(), 1);

        for i in 0..rounds {
            assert_eq!(fast_peer.next_output().await, format!("chunk-{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn byte_budget_overflow_evicts() {
        let broadcaster = Broadcaster::new();
        let (slow, _slow_peer) = subscriber(64, "guest_slow").await;
        broadcaster.subscribe(slow.token().clone(), slow.clone());

        // Two chunks of 600 KiB each: the first fits the budget, the
        // second blows through 1 MiB while the writer is still blocked.
        let chunk = vec![0x41u8; 600 * 1024];
        broadcaster.broadcast(output(&chunk));
        broadcaster.broadcast(output(&chunk));

        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_delivers_final_state_and_tears_down() {
        let broadcaster = Broadcaster::new();
        let (s1, mut p1) = subscriber(64 * 1024, "guest_one").await;
        broadcaster.subscribe(s1.token().clone(), s1.clone());

        broadcaster.broadcast(output(b"bye"));
        broadcaster.close(state(true));
        assert_eq!(broadcaster.subscriber_count(), 0);

        assert_eq!(p1.next_output().await, b"bye");
        match p1.next().await {
            Message::State(s) => assert!(s.disconnected),
            other => panic!("expected final state, got {other:?}"),
        }

        // The writer task drains and then closes the session.
        timeout(Duration::from_secs(2), async {
            while !s1.is_torn_down() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session should be torn down after close");
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_session() {
        let broadcaster = Broadcaster::new();
        let (old, _old_peer) = subscriber(64 * 1024, "guest_one").await;
        let (new, mut new_peer) = subscriber(64 * 1024, "guest_one").await;

        broadcaster.subscribe(old.token().clone(), old.clone());
        broadcaster.subscribe(new.token().clone(), new.clone());
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.broadcast(output(b"fresh"));
        assert_eq!(new_peer.next_output().await, b"fresh");

        timeout(Duration::from_secs(2), async {
            while !old.is_torn_down() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("replaced session should be torn down");
    }
}
