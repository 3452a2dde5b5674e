//! Input collector: per-warp fan-in of client keystrokes.
//!
//! Clients offer `{token, data}` chunks into a shared bounded queue. Each
//! client carries its own buffering budget (a semaphore released as chunks
//! are dequeued), so one chatty client cannot monopolize the queue and a
//! slow host consumer backpressures every sender fairly through the
//! channel's FIFO waiter order.
//!
//! Write-mode gating happens at the dequeue site in the warp's forward
//! loop, not here: a chunk buffered before a revoke must still be dropped.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};

use warp_core::constants::{INPUT_PER_CLIENT_CHUNKS, INPUT_QUEUE_CHUNKS};
use warp_core::error::{Error, Result};
use warp_core::protocol::UserToken;

/// One chunk of client input waiting to be forwarded to the host.
pub struct InputChunk {
    pub token: UserToken,
    pub data: Vec<u8>,
    /// Held until the chunk is dequeued; releasing it frees one slot of
    /// the originating client's buffering budget.
    _permit: OwnedSemaphorePermit,
}

/// Shared intake side of a warp's input collector.
#[derive(Clone)]
pub struct InputCollector {
    tx: mpsc::Sender<InputChunk>,
}

impl InputCollector {
    /// Create the collector and the receiver drained by the host forward
    /// loop.
    pub fn new() -> (Self, mpsc::Receiver<InputChunk>) {
        let (tx, rx) = mpsc::channel(INPUT_QUEUE_CHUNKS);
        (Self { tx }, rx)
    }

    /// Create a per-client handle with its own buffering budget.
    pub fn client_handle(&self, token: UserToken) -> ClientInput {
        ClientInput {
            tx: self.tx.clone(),
            budget: Arc::new(Semaphore::new(INPUT_PER_CLIENT_CHUNKS)),
            token,
        }
    }
}

/// Per-client intake handle.
///
/// `offer` suspends once the client has [`INPUT_PER_CLIENT_CHUNKS`] chunks
/// in flight or the shared queue is full, which pushes backpressure onto
/// the client's socket.
pub struct ClientInput {
    tx: mpsc::Sender<InputChunk>,
    budget: Arc<Semaphore>,
    token: UserToken,
}

impl ClientInput {
    pub async fn offer(&self, data: Vec<u8>) -> Result<()> {
        let permit = Arc::clone(&self.budget)
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        self.tx
            .send(InputChunk {
                token: self.token.clone(),
                data,
                _permit: permit,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}
