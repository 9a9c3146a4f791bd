//! Peer server: one connection per peer, sessions routed by id

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use spasm_core::constants::{NO_SESSION, RECV_CHUNK_SIZE};
use spasm_core::{
    spawn_supervised, Body, ByteBuffer, Counter, Error, GuardedMap, IdGenerator, Message,
    MessageType, NetworkComponent, PeerInfo, Promise, Result, Signal, StatusLog, TimingConfig,
};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::connection::{is_preferred_connection, ConnectionHandle, Outbox};
use crate::session::{SessionContext, SessionEntry, SessionHandler};

type ReplyKey = (String, u64);

/// Connection and session orchestrator for one process role
pub struct PeerServer {
    identity: NetworkComponent,
    directory: HashMap<String, NetworkComponent>,
    handler: Arc<dyn SessionHandler>,
    timing: TimingConfig,
    signal: Signal,
    status: StatusLog,
    ids: IdGenerator,
    session_serials: Counter,
    sessions: GuardedMap<u64, SessionEntry>,
    outgoing: GuardedMap<NetworkComponent, Outbox>,
    connections: GuardedMap<NetworkComponent, Arc<ConnectionHandle>>,
    replies: GuardedMap<ReplyKey, Arc<Promise<Message>>>,
}

impl PeerServer {
    pub fn builder(identity: NetworkComponent, handler: Arc<dyn SessionHandler>) -> PeerServerBuilder {
        PeerServerBuilder::new(identity, handler)
    }

    pub fn identity(&self) -> &NetworkComponent {
        &self.identity
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn status(&self) -> &StatusLog {
        &self.status
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Mint a message id unique to this server
    pub fn next_id(&self) -> u64 {
        self.ids.next_id()
    }

    /// Resolve an identity key through the directory
    pub fn lookup(&self, key: &str) -> Option<NetworkComponent> {
        self.directory.get(key).cloned()
    }

    /// Stop every worker of this server
    pub fn shutdown(&self) {
        self.signal.trigger();
    }

    /// The outbound queue of `peer`, created and registered if absent
    pub fn get_or_create_outbound_queue(&self, peer: &NetworkComponent) -> Outbox {
        self.outgoing.get_or_insert_with(peer.clone(), Outbox::new)
    }

    /// Whether `peer` has an accepted connection
    pub fn is_connected(&self, peer: &NetworkComponent) -> bool {
        self.connections
            .with(|connections| connections.get(peer).is_some_and(|c| c.is_active()))
    }

    /// Start dialing `peer` unless a connection is registered.
    ///
    /// The pending connection is registered before dialing so concurrent
    /// callers dial once. Returns whether a dial was started.
    pub fn connect(self: &Arc<Self>, peer: &NetworkComponent) -> bool {
        let Some(address) = peer.address() else {
            return false;
        };
        let handle = self.connections.with(|connections| {
            if connections.contains_key(peer) {
                return None;
            }
            let handle = Arc::new(ConnectionHandle::new(
                rand::thread_rng().gen(),
                self.signal.derive(),
            ));
            connections.insert(peer.clone(), handle.clone());
            Some(handle)
        });
        let Some(handle) = handle else {
            return false;
        };
        spawn_supervised(
            format!("dial {}", peer),
            self.signal.clone(),
            self.clone().dial(peer.clone(), address, handle),
        );
        true
    }

    /// Connect to `peer` and wait until the handshake is accepted
    pub async fn connect_and_wait(self: &Arc<Self>, peer: &NetworkComponent, timeout: Duration) -> Result<()> {
        let bounded = self.signal.derive_with_timeout(timeout);
        loop {
            if self.is_connected(peer) {
                return Ok(());
            }
            self.connect(peer);
            bounded
                .guard(tokio::time::sleep(self.timing.poll_interval()))
                .await
                .map_err(|e| match e {
                    Error::Timeout(_) => {
                        Error::timeout(format!("Could not connect to {} in time.", peer))
                    }
                    other => other,
                })?;
        }
    }

    /// Drop the connection to `peer`, if any
    pub fn disconnect(&self, peer: &NetworkComponent) -> bool {
        match self.connections.remove(peer) {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Queue `message` for `peer`, dialing if needed
    pub fn send(self: &Arc<Self>, peer: &NetworkComponent, message: Message) {
        tracing::trace!(peer = %peer, message = %message, "Queueing message");
        self.get_or_create_outbound_queue(peer).push(message);
        self.connect(peer);
    }

    pub fn reply(self: &Arc<Self>, peer: &NetworkComponent, request: &Message, success: bool, data: Option<Value>) {
        self.send(peer, request.generate_reply(success, data));
    }

    /// Send `message` and wait for the response with the same id
    pub async fn request(self: &Arc<Self>, peer: &NetworkComponent, message: Message, timeout: Duration) -> Result<Message> {
        let key = (peer.key().to_string(), message.id);
        let promise = Arc::new(Promise::new());
        self.replies.insert(key.clone(), promise.clone());
        self.send(peer, message);

        let result = self.signal.guard(promise.get(Some(timeout))).await;
        self.replies.remove(&key);
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(Error::Timeout(_))) => Err(Error::timeout(format!(
                "No response from {} within {:?}.",
                peer, timeout
            ))),
            Ok(Err(e)) | Err(e) => Err(e),
        }
    }

    /// Replace the session at `id` with a fresh one and start its handler.
    ///
    /// Returns whether a previous session was killed.
    pub fn new_session(self: &Arc<Self>, id: u64) -> bool {
        let serial = self.session_serials.inc();
        let signal = self.signal.derive_with_timeout(self.timing.session_timeout());
        let (context, entry) = SessionContext::new(id, serial, signal);
        let replaced = self.sessions.with(|sessions| {
            let old = sessions.insert(id, entry);
            if let Some(old) = &old {
                old.kill();
            }
            old.is_some()
        });
        if replaced {
            tracing::debug!(session_id = id, "Replaced existing session");
        }

        let server = self.clone();
        tokio::spawn(async move {
            let result = server.handler.run_session(server.clone(), context).await;
            server.sessions.with(|sessions| {
                if sessions.get(&id).is_some_and(|s| s.serial == serial) {
                    sessions.remove(&id);
                }
            });
            match result {
                Ok(()) => tracing::debug!(session_id = id, "Session finished"),
                Err(Error::Cancelled) => tracing::debug!(session_id = id, "Session cancelled"),
                Err(e) if e.is_session_scoped() => {
                    server.status.error("SESSION", format!("Session {} aborted: {}", id, e));
                }
                Err(e) => {
                    server.status.error("SESSION", format!("Session {} failed: {}", id, e));
                    server.signal.trigger();
                }
            }
        });
        replaced
    }

    /// Remove and cancel the session at `id`. Returns whether it existed.
    pub fn kill_session(&self, id: u64) -> bool {
        match self.sessions.remove(&id) {
            Some(entry) => {
                entry.kill();
                true
            }
            None => false,
        }
    }

    pub fn has_session(&self, id: u64) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Queue `message` on the inbound queue of its session
    pub fn forward_to_session(&self, sender: &NetworkComponent, message: Message) -> Result<()> {
        let session_id = message.session_id;
        let entry = self
            .sessions
            .get_cloned(&session_id)
            .ok_or_else(|| Error::protocol(format!("No session with id {}.", session_id)))?;
        entry
            .tx
            .send((sender.clone(), message))
            .map_err(|_| Error::protocol(format!("Session {} is closing.", session_id)))
    }

    /// Dial peers that have queued messages but no connection
    pub fn update_connections(self: &Arc<Self>) {
        let waiting: Vec<NetworkComponent> = self.outgoing.with(|outgoing| {
            outgoing
                .iter()
                .filter(|(_, outbox)| outbox.pending() > 0)
                .map(|(peer, _)| peer.clone())
                .collect()
        });
        for peer in waiting {
            if self.connect(&peer) {
                tracing::debug!(peer = %peer, "Reconnecting for queued messages");
            }
        }
    }

    /// Accept loop; also runs the maintenance pass
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        self.status.post("SERVER", format!("Started Server. Listening on {}.", local));
        let mut maintenance = tokio::time::interval(self.timing.connection_update());

        loop {
            tokio::select! {
                _ = self.signal.triggered() => break,
                _ = maintenance.tick() => self.update_connections(),
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        spawn_supervised(
                            format!("connection {}", addr),
                            self.signal.clone(),
                            self.clone().accept_connection(stream, addr),
                        );
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        self.close_all();
        self.status.post("SERVER", "Closed Server.");
        Ok(())
    }

    /// Maintenance loop for a role without a listener
    pub async fn run_maintenance(self: Arc<Self>) -> Result<()> {
        let mut maintenance = tokio::time::interval(self.timing.connection_update());
        loop {
            tokio::select! {
                _ = self.signal.triggered() => break,
                _ = maintenance.tick() => self.update_connections(),
            }
        }
        self.close_all();
        Ok(())
    }

    /// Spawn [`PeerServer::serve`] as a supervised worker
    pub fn spawn(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        spawn_supervised("server", self.signal.clone(), self.clone().serve(listener))
    }

    fn close_all(&self) {
        let handles: Vec<_> = self
            .connections
            .with(|connections| connections.drain().map(|(_, h)| h).collect());
        for handle in handles {
            handle.close();
        }
    }

    fn release(&self, peer: &NetworkComponent, handle: &ConnectionHandle) {
        self.connections.with(|connections| {
            if connections.get(peer).is_some_and(|c| c.id() == handle.id()) {
                connections.remove(peer);
            }
        });
        handle.close();
    }

    async fn dial(self: Arc<Self>, peer: NetworkComponent, address: SocketAddr, handle: Arc<ConnectionHandle>) -> Result<()> {
        let bounded = handle.signal().derive_with_timeout(self.timing.request_timeout());
        let connected = bounded
            .guard(TcpStream::connect(address))
            .await
            .and_then(|r| r.map_err(Error::from));
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                self.status.error("NETWORK", format!("Could not connect to {} at {}: {}", peer, address, e));
                self.release(&peer, &handle);
                return Ok(());
            }
        };

        match self.handshake(stream, &handle, &bounded).await {
            Ok(stream) => {
                let current = self.connections.with(|connections| {
                    match connections.get(&peer) {
                        Some(c) if c.id() == handle.id() => {
                            c.activate();
                            true
                        }
                        _ => false,
                    }
                });
                if !current {
                    tracing::debug!(peer = %peer, "Dialed connection superseded");
                    handle.close();
                    return Ok(());
                }
                self.status.post("NETWORK", format!("Connected to {} at {}.", peer, address));
                self.serve_connection(peer, handle, stream).await
            }
            Err(e) => {
                self.status.error("NETWORK", format!("Handshake with {} failed: {}", peer, e));
                self.release(&peer, &handle);
                Ok(())
            }
        }
    }

    async fn handshake(&self, mut stream: TcpStream, handle: &ConnectionHandle, bounded: &Signal) -> Result<TcpStream> {
        let hello = Message::from_body(
            self.next_id(),
            Body::Info(PeerInfo {
                component: self.identity.key().to_string(),
                connection: handle.id(),
            }),
        )?;
        bounded.guard(hello.write_to(&mut stream)).await??;
        let reply = Message::read_from(&mut stream, Some(bounded)).await?;
        if reply.id != hello.id || !reply.is_response() {
            return Err(Error::protocol("Unexpected handshake reply."));
        }
        if !reply.is_ok() {
            return Err(Error::protocol("Connection rejected by peer."));
        }
        Ok(stream)
    }

    async fn accept_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        self.status.post("SERVER", format!("Start of connection with {}.", addr));
        match self.admit(stream, addr).await {
            Some((peer, handle, stream)) => self.serve_connection(peer, handle, stream).await,
            None => {
                self.status.post("SERVER", format!("End of connection with {}.", addr));
                Ok(())
            }
        }
    }

    /// Run the accepting side of the handshake. `None` means the socket
    /// is to be dropped.
    async fn admit(&self, mut stream: TcpStream, addr: SocketAddr) -> Option<(NetworkComponent, Arc<ConnectionHandle>, TcpStream)> {
        let bounded = self.signal.derive_with_timeout(self.timing.request_timeout());

        let hello = match Message::read_from(&mut stream, Some(&bounded)).await {
            Ok(hello) => hello,
            Err(e) => {
                self.status.error("SERVER", format!("No handshake from {}: {}", addr, e));
                return None;
            }
        };
        let (peer, connection_id) = match self.resolve_peer(&hello) {
            Ok(found) => found,
            Err(e) => {
                self.status.error("SERVER", format!("Rejected {}: {}", addr, e));
                let _ = hello.generate_reply(false, None).write_to(&mut stream).await;
                return None;
            }
        };

        let handle = Arc::new(ConnectionHandle::new(connection_id, self.signal.derive()));
        let accepted = self.connections.with(|connections| {
            if is_preferred_connection(connections.get(&peer).map(Arc::as_ref), connection_id) {
                return false;
            }
            if let Some(old) = connections.insert(peer.clone(), handle.clone()) {
                old.close();
            }
            handle.activate();
            true
        });

        let reply = hello.generate_reply(accepted, None);
        if let Err(e) = bounded.guard(reply.write_to(&mut stream)).await.and_then(|r| r) {
            self.status.error("SERVER", format!("Handshake reply to {} failed: {}", peer, e));
            self.release(&peer, &handle);
            return None;
        }
        if !accepted {
            self.status.error(
                "SERVER",
                format!("There's already an established connection with {}.", peer),
            );
            return None;
        }
        Some((peer, handle, stream))
    }

    fn resolve_peer(&self, hello: &Message) -> Result<(NetworkComponent, u64)> {
        match hello.body()? {
            Body::Info(PeerInfo { component, connection }) => {
                let peer = self
                    .lookup(&component)
                    .ok_or_else(|| Error::protocol(format!("Unknown component `{}`.", component)))?;
                Ok((peer, connection))
            }
            _ => Err(Error::protocol(format!(
                "Expected INFO handshake, got {}.",
                hello.kind
            ))),
        }
    }

    async fn serve_connection(self: Arc<Self>, peer: NetworkComponent, handle: Arc<ConnectionHandle>, stream: TcpStream) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let writer = tokio::spawn(self.clone().write_loop(peer.clone(), handle.clone(), write_half));

        let result = self.read_loop(&peer, &handle, read_half).await;

        self.release(&peer, &handle);
        let _ = writer.await;
        self.status.post("SERVER", format!("End of connection with {}.", peer));

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_session_scoped() || matches!(e, Error::Io(_)) => {
                self.status.error("NETWORK", format!("Connection with {} closed: {}", peer, e));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_loop(self: &Arc<Self>, peer: &NetworkComponent, handle: &ConnectionHandle, mut reader: OwnedReadHalf) -> Result<()> {
        let mut buffer = ByteBuffer::new();
        let mut chunk = vec![0u8; RECV_CHUNK_SIZE];
        loop {
            let read = match handle.signal().guard(reader.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => return Ok(()),
            };
            if read == 0 {
                return Ok(());
            }
            buffer.append(&chunk[..read]);
            for message in buffer.drain_messages()? {
                tracing::trace!(peer = %peer, message = %message, "Received message");
                self.dispatch(peer, message).await?;
            }
        }
    }

    async fn write_loop(self: Arc<Self>, peer: NetworkComponent, handle: Arc<ConnectionHandle>, mut writer: OwnedWriteHalf) {
        let outbox = self.get_or_create_outbound_queue(&peer);
        let signal = handle.signal();
        let Ok(mut rx) = signal.guard(outbox.rx.lock()).await else {
            return;
        };
        while let Ok(Some(message)) = signal.guard(rx.recv()).await {
            outbox.mark_sent();
            match message.write_to(&mut writer).await {
                Ok(()) => tracing::trace!(peer = %peer, message = %message, "Sent message"),
                Err(Error::ProtocolViolation(reason)) => {
                    self.status.error("NETWORK", format!("Dropped unencodable message to {}: {}", peer, reason));
                }
                Err(e) => {
                    self.status.error("NETWORK", format!("Write to {} failed: {}", peer, e));
                    handle.close();
                    return;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, sender: &NetworkComponent, message: Message) -> Result<()> {
        if message.is_response() {
            let key = (sender.key().to_string(), message.id);
            if let Some(promise) = self.replies.get_cloned(&key) {
                promise.resolve(message);
            } else if message.session_id != NO_SESSION && self.has_session(message.session_id) {
                self.forward_to_session(sender, message)?;
            } else {
                tracing::debug!(peer = %sender, message = %message, "Dropping unmatched response");
            }
            return Ok(());
        }

        match message.kind {
            MessageType::Ping => {
                self.reply(sender, &message, true, None);
                Ok(())
            }
            MessageType::EndSession => {
                let existed = self.kill_session(message.session_id);
                self.reply(sender, &message, existed, None);
                Ok(())
            }
            _ if message.session_id == NO_SESSION => {
                let request = message.clone();
                match self.handler.handle_message(self, sender, message).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_session_scoped() => {
                        self.status.error("SESSION", format!("Request {} failed: {}", request, e));
                        self.reply(sender, &request, false, Some(Value::String(e.to_string())));
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            kind => {
                if kind == MessageType::NewSession || self.handler.opens_session(kind) {
                    self.new_session(message.session_id);
                }
                // Routing failures are answered, the connection stays up
                if let Err(e) = self.forward_to_session(sender, message.clone()) {
                    self.status.error("SESSION", format!("Cannot route {}: {}", message, e));
                    self.reply(sender, &message, false, Some(Value::String(e.to_string())));
                }
                Ok(())
            }
        }
    }
}

/// Builder for [`PeerServer`]
pub struct PeerServerBuilder {
    identity: NetworkComponent,
    handler: Arc<dyn SessionHandler>,
    peers: Vec<NetworkComponent>,
    timing: TimingConfig,
    signal: Option<Signal>,
    status: Option<StatusLog>,
}

impl PeerServerBuilder {
    pub fn new(identity: NetworkComponent, handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            identity,
            handler,
            peers: Vec::new(),
            timing: TimingConfig::default(),
            signal: None,
            status: None,
        }
    }

    /// Components this server may talk to; identity keys must be unique
    pub fn peers(mut self, peers: impl IntoIterator<Item = NetworkComponent>) -> Self {
        self.peers.extend(peers);
        self
    }

    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Parent shutdown signal; the server derives its own from it
    pub fn signal(mut self, signal: &Signal) -> Self {
        self.signal = Some(signal.derive());
        self
    }

    pub fn status(mut self, status: StatusLog) -> Self {
        self.status = Some(status);
        self
    }

    pub fn build(self) -> Arc<PeerServer> {
        let directory = self
            .peers
            .into_iter()
            .filter(|peer| *peer != self.identity)
            .map(|peer| (peer.key().to_string(), peer))
            .collect();
        let status = self
            .status
            .unwrap_or_else(|| StatusLog::new(self.identity.key().to_string()));
        Arc::new(PeerServer {
            identity: self.identity,
            directory,
            handler: self.handler,
            timing: self.timing,
            signal: self.signal.unwrap_or_default(),
            status,
            ids: IdGenerator::new(),
            session_serials: Counter::default(),
            sessions: GuardedMap::new(),
            outgoing: GuardedMap::new(),
            connections: GuardedMap::new(),
            replies: GuardedMap::new(),
        })
    }
}
