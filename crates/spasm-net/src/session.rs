//! Sessions: multi-step conversations scoped by `session_id`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spasm_core::{Error, Message, MessageType, NetworkComponent, Result, Signal};
use tokio::sync::mpsc;

use crate::server::PeerServer;

/// Inbound item of a session queue
pub type Envelope = (NetworkComponent, Message);

/// Role-specific behaviour plugged into a [`PeerServer`]
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Handle a request outside any session (`session_id == 0`).
    ///
    /// PING and END_SESSION never reach this; the server answers them.
    async fn handle_message(
        &self,
        server: &Arc<PeerServer>,
        sender: &NetworkComponent,
        message: Message,
    ) -> Result<()>;

    /// Body of one session. Runs on its own task until it returns, the
    /// session is replaced or killed, or its deadline passes.
    async fn run_session(&self, server: Arc<PeerServer>, session: SessionContext) -> Result<()>;

    /// Whether a message of this type starts a fresh session at its id
    fn opens_session(&self, _kind: MessageType) -> bool {
        false
    }
}

/// Registry entry kept by the server for a live session
#[derive(Debug, Clone)]
pub(crate) struct SessionEntry {
    pub(crate) serial: u64,
    pub(crate) signal: Signal,
    pub(crate) tx: mpsc::UnboundedSender<Envelope>,
}

impl SessionEntry {
    pub(crate) fn kill(&self) {
        self.signal.trigger();
    }
}

/// The session side handed to [`SessionHandler::run_session`]
#[derive(Debug)]
pub struct SessionContext {
    id: u64,
    signal: Signal,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl SessionContext {
    pub(crate) fn new(id: u64, serial: u64, signal: Signal) -> (Self, SessionEntry) {
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = SessionEntry {
            serial,
            signal: signal.clone(),
            tx,
        };
        (Self { id, signal, rx }, entry)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fires when the session is killed, replaced, expires or the server stops
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Next inbound message, in arrival order
    pub async fn next(&mut self) -> Result<Envelope> {
        self.signal
            .guard(self.rx.recv())
            .await?
            .ok_or(Error::Cancelled)
    }

    /// Next inbound message, waiting at most `timeout`
    pub async fn next_timeout(&mut self, timeout: Duration) -> Result<Envelope> {
        let bounded = self.signal.derive_with_timeout(timeout);
        bounded.guard(self.rx.recv()).await?.ok_or(Error::Cancelled)
    }

    /// Take an already-queued message without waiting
    pub fn try_next(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_receives_in_order() {
        let (mut ctx, entry) = SessionContext::new(5, 1, Signal::new());
        for id in 1..=3 {
            entry
                .tx
                .send((
                    NetworkComponent::CoordinatorBackend,
                    Message::new(MessageType::Ping, id, None).with_session(5),
                ))
                .unwrap();
        }
        for id in 1..=3 {
            let (_, message) = ctx.next().await.unwrap();
            assert_eq!(message.id, id);
        }
        assert!(ctx.try_next().is_none());
        assert_eq!(ctx.id(), 5);
    }

    #[tokio::test]
    async fn test_killed_session_stops_waiting() {
        let (mut ctx, entry) = SessionContext::new(1, 1, Signal::new());
        entry.kill();
        assert!(matches!(ctx.next().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_next_timeout() {
        let (mut ctx, _entry) = SessionContext::new(1, 1, Signal::new());
        let result = ctx.next_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(!ctx.signal().is_triggered());
    }
}
