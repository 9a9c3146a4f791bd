//! Per-peer connection state and outbound queues

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spasm_core::{Counter, Message, Signal};
use tokio::sync::{mpsc, Mutex};

/// A live or pending socket bound to one peer.
///
/// Pending until its handshake is accepted, active afterwards. Triggering
/// the signal stops both the reader and the writer of the socket.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    active: AtomicBool,
    signal: Signal,
}

impl ConnectionHandle {
    pub fn new(id: u64, signal: Signal) -> Self {
        Self {
            id,
            active: AtomicBool::new(false),
            signal,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.signal.trigger();
    }
}

/// Tie-break for two connections claiming the same peer.
///
/// True when `existing` wins over an incoming connection with id
/// `incoming_id`: it is already active or has the larger id. Both ends
/// apply the same rule to the same pair of ids, so a simultaneous dial
/// converges on one surviving connection.
pub fn is_preferred_connection(existing: Option<&ConnectionHandle>, incoming_id: u64) -> bool {
    existing.is_some_and(|conn| conn.is_active() || conn.id() > incoming_id)
}

/// Outbound queue of one peer.
///
/// Outlives any single connection: whichever connection currently serves
/// the peer holds the receiver, and messages queued while no connection
/// exists wait for the next one.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Message>,
    pub(crate) rx: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    queued: Arc<Counter>,
}

impl Outbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            queued: Arc::new(Counter::default()),
        }
    }

    pub fn push(&self, message: Message) {
        self.queued.inc();
        // The receiver lives in this outbox, so the channel never closes
        let _ = self.tx.send(message);
    }

    pub(crate) fn mark_sent(&self) {
        self.queued.dec();
    }

    /// Messages queued but not yet written
    pub fn pending(&self) -> u64 {
        self.queued.get()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}
