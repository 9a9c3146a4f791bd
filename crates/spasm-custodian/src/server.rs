//! Custodian process: ring participant and pseudonymized data source

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use spasm_core::{
    spawn_supervised, Body, DiffieHellmanState, Error, Group, Message, MessageType,
    NetworkComponent, NetworkConfig, SharedSecret, Signal, StatusLog,
};
use spasm_net::{async_trait, PeerServer, SessionContext, SessionHandler};
use tokio::net::TcpListener;

use crate::data::DataComponent;
use crate::error::{CustodianError, Result};
use crate::store::RecordStore;

/// Position of this custodian in one session's ring
struct Ring {
    prev: NetworkComponent,
    next: NetworkComponent,
    state: DiffieHellmanState,
}

/// Session logic of a custodian.
///
/// A session opens with KEY_EXCHANGE_INIT, runs the ring exchange on
/// KEY_EXCHANGE_START and ends after serving one DATA_REQUEST.
pub struct CustodianHandler<S> {
    id: String,
    ring_order: Vec<String>,
    group: &'static Group,
    step_timeout: Duration,
    data: Arc<DataComponent<S>>,
    status: StatusLog,
}

impl<S: RecordStore> CustodianHandler<S> {
    pub fn new(config: &NetworkConfig, id: impl Into<String>, data: Arc<DataComponent<S>>, status: StatusLog) -> Self {
        Self {
            id: id.into(),
            ring_order: config.data_servers.iter().map(|s| s.id.clone()).collect(),
            group: config.key_group(),
            step_timeout: config.timing.request_timeout(),
            data,
            status,
        }
    }

    /// Order `members` by configuration and find this custodian's neighbours
    async fn prepare_ring(&self, server: &PeerServer, members: &[String]) -> spasm_core::Result<Ring> {
        if let Some(unknown) = members.iter().find(|m| !self.ring_order.contains(m)) {
            return Err(Error::key_exchange(format!(
                "Unknown data server `{}` in ring.",
                unknown
            )));
        }
        let active: Vec<&String> = self
            .ring_order
            .iter()
            .filter(|id| members.contains(*id))
            .collect();
        let index = active
            .iter()
            .position(|id| **id == self.id)
            .ok_or_else(|| Error::key_exchange(format!("`{}` is not part of the ring.", self.id)))?;

        let n = active.len();
        let resolve = |id: &str| -> spasm_core::Result<NetworkComponent> {
            if id == self.id {
                return Ok(server.identity().clone());
            }
            server
                .lookup(id)
                .ok_or_else(|| Error::key_exchange(format!("No route to ring member `{}`.", id)))
        };
        let prev = resolve(active[(index + n - 1) % n].as_str())?;
        let next = resolve(active[(index + 1) % n].as_str())?;

        let group = self.group;
        let state = offload(move || DiffieHellmanState::with_group(n, group)).await?;
        self.status.post("KEY EXCHANGE", "Initialized key exchange component.");
        Ok(Ring { prev, next, state })
    }

    /// Run the N - 1 ring rounds and return the hashed group secret
    async fn exchange(
        &self,
        server: &Arc<PeerServer>,
        session: &mut SessionContext,
        pending: &mut VecDeque<(NetworkComponent, String)>,
        ring: Ring,
    ) -> spasm_core::Result<SharedSecret> {
        let Ring { prev, next, mut state } = ring;
        for _ in 1..state.parties() {
            let key = state.group().key_to_hex(state.public_key()?);
            let step = Message::from_body(server.next_id(), Body::KeyExchangeStep { key })?
                .with_session(session.id());
            server.send(&next, step);

            let (sender, key) = match pending.pop_front() {
                Some(buffered) => buffered,
                None => self.next_step(server, session).await?,
            };
            if sender != prev {
                return Err(Error::key_exchange(format!(
                    "Ring step from {} but the predecessor is {}.",
                    sender, prev
                )));
            }
            let key = state.group().key_from_hex(&key)?;
            state = offload(move || {
                state.transform(&key)?;
                Ok(state)
            })
            .await?;
        }
        state
            .result()
            .ok_or_else(|| Error::key_exchange("Ring finished without a result."))
    }

    /// Wait for the next KEY_EXCHANGE_STEP, refusing other requests meanwhile
    async fn next_step(&self, server: &Arc<PeerServer>, session: &mut SessionContext) -> spasm_core::Result<(NetworkComponent, String)> {
        loop {
            let (sender, message) = session.next_timeout(self.step_timeout).await.map_err(|e| match e {
                Error::Timeout(_) => Error::timeout("No key from the ring predecessor in time."),
                other => other,
            })?;
            match message.body() {
                Ok(Body::KeyExchangeStep { key }) => return Ok((sender, key)),
                Ok(Body::Response { .. }) => continue,
                _ => server.reply(
                    &sender,
                    &message,
                    false,
                    Some(Value::String("Key exchange in progress.".into())),
                ),
            }
        }
    }
}

#[async_trait]
impl<S: RecordStore> SessionHandler for CustodianHandler<S> {
    async fn handle_message(&self, _server: &Arc<PeerServer>, _sender: &NetworkComponent, message: Message) -> spasm_core::Result<()> {
        Err(Error::protocol(format!(
            "Message of type '{}' requires a session.",
            message.kind
        )))
    }

    async fn run_session(&self, server: Arc<PeerServer>, mut session: SessionContext) -> spasm_core::Result<()> {
        let mut ring: Option<Ring> = None;
        let mut secret: Option<SharedSecret> = None;
        let mut pending: VecDeque<(NetworkComponent, String)> = VecDeque::new();

        loop {
            let (sender, message) = session.next().await?;
            tracing::debug!(
                session_id = session.id(),
                peer = %sender,
                message = %message,
                "Session message"
            );
            let body = match message.body() {
                Ok(body) => body,
                Err(e) => {
                    server.reply(&sender, &message, false, Some(Value::String(e.to_string())));
                    continue;
                }
            };

            match body {
                Body::Response { .. } => {}
                Body::NewSession => server.reply(&sender, &message, true, None),
                Body::KeyExchangeInit { members } => match self.prepare_ring(&server, &members).await {
                    Ok(prepared) => {
                        ring = Some(prepared);
                        secret = None;
                        server.reply(&sender, &message, true, None);
                    }
                    Err(e) => {
                        server.reply(&sender, &message, false, Some(Value::String(e.to_string())));
                        return Err(e);
                    }
                },
                Body::KeyExchangeStep { key } => pending.push_back((sender, key)),
                Body::KeyExchangeStart => {
                    let Some(prepared) = ring.take() else {
                        server.reply(
                            &sender,
                            &message,
                            false,
                            Some(Value::String("Key exchange was not initialized.".into())),
                        );
                        continue;
                    };
                    match self.exchange(&server, &mut session, &mut pending, prepared).await {
                        Ok(shared) => {
                            let proof = shared.proof();
                            secret = Some(shared);
                            self.status.post("KEY EXCHANGE", "Key exchange done.");
                            server.reply(&sender, &message, true, Some(Value::String(proof)));
                        }
                        Err(e) => {
                            server.reply(&sender, &message, false, Some(Value::String(e.to_string())));
                            return Err(e);
                        }
                    }
                }
                Body::DataRequest { ids } => {
                    let Some(salt) = secret.clone() else {
                        server.reply(
                            &sender,
                            &message,
                            false,
                            Some(Value::String("No shared key for this session.".into())),
                        );
                        continue;
                    };
                    let rows = self.data.request(ids, salt).await?;
                    self.status.post("DATA", format!("Serving {} rows.", rows.len()));
                    server.reply(&sender, &message, true, Some(serde_json::to_value(rows)?));
                    return Ok(());
                }
                other => server.reply(
                    &sender,
                    &message,
                    false,
                    Some(Value::String(format!(
                        "Unexpected message of type '{}' in session.",
                        other.kind()
                    ))),
                ),
            }
        }
    }

    fn opens_session(&self, kind: MessageType) -> bool {
        kind == MessageType::KeyExchangeInit
    }
}

/// Run modular exponentiation off the async workers
async fn offload<T: Send + 'static>(work: impl FnOnce() -> spasm_core::Result<T> + Send + 'static) -> spasm_core::Result<T> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::key_exchange(format!("Key computation aborted: {}", e)))?
}

/// A running custodian: peer server plus data worker
pub struct CustodianServer<S> {
    peer: Arc<PeerServer>,
    data: Arc<DataComponent<S>>,
    address: SocketAddr,
}

impl<S: RecordStore> CustodianServer<S> {
    pub fn peer(&self) -> &Arc<PeerServer> {
        &self.peer
    }

    pub fn data(&self) -> &Arc<DataComponent<S>> {
        &self.data
    }

    /// Address from the network configuration
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn signal(&self) -> &Signal {
        self.peer.signal()
    }

    pub fn shutdown(&self) {
        self.peer.shutdown();
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let data = self.data.clone();
        let signal = self.peer.signal().clone();
        let worker = spawn_supervised("data", signal.clone(), async move { data.run(signal).await });

        let result = self.peer.clone().serve(listener).await;
        self.peer.shutdown();
        let _ = worker.await;
        result.map_err(CustodianError::from)
    }

    /// Bind the configured address and serve
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.address).await?;
        self.serve(listener).await
    }
}

/// Builder for [`CustodianServer`]
pub struct CustodianBuilder {
    config: NetworkConfig,
    id: String,
    status: Option<StatusLog>,
    signal: Option<Signal>,
}

impl CustodianBuilder {
    pub fn new(config: NetworkConfig, id: impl Into<String>) -> Self {
        Self {
            config,
            id: id.into(),
            status: None,
            signal: None,
        }
    }

    pub fn status(mut self, status: StatusLog) -> Self {
        self.status = Some(status);
        self
    }

    /// Parent shutdown signal
    pub fn signal(mut self, signal: &Signal) -> Self {
        self.signal = Some(signal.clone());
        self
    }

    pub fn build<S: RecordStore>(self, store: S) -> Result<CustodianServer<S>> {
        let this = self
            .config
            .data_server(&self.id)
            .cloned()
            .ok_or_else(|| CustodianError::UnknownDataServer(self.id.clone()))?;
        let address = this.address;
        let identity = NetworkComponent::from(this);
        let status = self
            .status
            .unwrap_or_else(|| StatusLog::new(format!("custodian {}", self.id)));

        let data = Arc::new(DataComponent::new(store, status.clone()));
        let handler = CustodianHandler::new(&self.config, self.id, data.clone(), status.clone());

        let mut peers = self.config.components();
        peers.push(NetworkComponent::CoordinatorBackend);
        let mut builder = PeerServer::builder(identity, Arc::new(handler))
            .peers(peers)
            .timing(self.config.timing.clone())
            .status(status);
        if let Some(signal) = &self.signal {
            builder = builder.signal(signal);
        }

        Ok(CustodianServer {
            peer: builder.build(),
            data,
            address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use spasm_core::{DataServer, GroupKind, TimingConfig};
    use tokio::task::JoinSet;

    struct Idle;

    #[async_trait]
    impl SessionHandler for Idle {
        async fn handle_message(&self, _server: &Arc<PeerServer>, _sender: &NetworkComponent, _message: Message) -> spasm_core::Result<()> {
            Err(Error::protocol("idle"))
        }

        async fn run_session(&self, _server: Arc<PeerServer>, _session: SessionContext) -> spasm_core::Result<()> {
            Ok(())
        }
    }

    fn timing() -> TimingConfig {
        TimingConfig {
            poll_interval_ms: 5,
            request_timeout_ms: 5000,
            connection_update_ms: 50,
            session_timeout_ms: 10000,
        }
    }

    fn store(ids: &[&str]) -> MemoryStore {
        let mut store = MemoryStore::new();
        for (i, id) in ids.iter().enumerate() {
            store.insert(*id, json!({ "value": i }).as_object().cloned().unwrap());
        }
        store
    }

    fn coordinator(config: &NetworkConfig) -> Arc<PeerServer> {
        PeerServer::builder(NetworkComponent::CoordinatorBackend, Arc::new(Idle))
            .peers(config.components())
            .timing(timing())
            .build()
    }

    async fn broadcast(coordinator: &Arc<PeerServer>, config: &NetworkConfig, body: Body, session: u64) -> Vec<Message> {
        let mut requests = JoinSet::new();
        for peer in config.components() {
            let coordinator = coordinator.clone();
            let message = Message::from_body(coordinator.next_id(), body.clone())
                .unwrap()
                .with_session(session);
            requests.spawn(async move {
                coordinator
                    .request(&peer, message, Duration::from_secs(15))
                    .await
                    .unwrap()
            });
        }
        let mut replies = Vec::new();
        while let Some(reply) = requests.join_next().await {
            replies.push(reply.unwrap());
        }
        replies
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ring_exchange_agrees_and_labels_join() {
        let (config, custodians) = network(3).await;
        let coordinator = coordinator(&config);
        let members: Vec<String> = config.data_servers.iter().map(|s| s.id.clone()).collect();

        let init = broadcast(&coordinator, &config, Body::KeyExchangeInit { members }, 7).await;
        assert!(init.iter().all(Message::is_ok));

        let proofs = broadcast(&coordinator, &config, Body::KeyExchangeStart, 7).await;
        assert!(proofs.iter().all(Message::is_ok));
        let first = proofs[0].data.clone().unwrap();
        assert!(proofs.iter().all(|p| p.data.as_ref() == Some(&first)));

        let ids = vec!["shared".to_string(), "absent".to_string()];
        let rows = broadcast(&coordinator, &config, Body::DataRequest { ids }, 7).await;
        let labels: Vec<Value> = rows
            .iter()
            .map(|reply| {
                let rows = reply.data.as_ref().unwrap().as_array().unwrap();
                assert_eq!(rows.len(), 1);
                rows[0][0].clone()
            })
            .collect();
        assert!(labels.iter().all(|label| *label == labels[0]));

        coordinator.shutdown();
        for custodian in custodians {
            custodian.shutdown();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ring_exchange_in_default_group() {
        let (config, custodians) = network_in(3, GroupKind::default()).await;
        assert_eq!(config.key_group().modulus().bits(), 4096);
        let coordinator = coordinator(&config);
        let members: Vec<String> = config.data_servers.iter().map(|s| s.id.clone()).collect();

        let init = broadcast(&coordinator, &config, Body::KeyExchangeInit { members }, 11).await;
        assert!(init.iter().all(Message::is_ok));
        let proofs = broadcast(&coordinator, &config, Body::KeyExchangeStart, 11).await;
        assert!(proofs.iter().all(Message::is_ok));
        let first = proofs[0].data.clone().unwrap();
        assert_eq!(first.as_str().unwrap().len(), 96);
        assert!(proofs.iter().all(|p| p.data.as_ref() == Some(&first)));

        coordinator.shutdown();
        for custodian in custodians {
            custodian.shutdown();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_init_rejects_foreign_ring() {
        let (config, custodians) = network(1).await;
        let coordinator = coordinator(&config);
        let target = config.components().remove(0);

        let init = Message::from_body(
            coordinator.next_id(),
            Body::KeyExchangeInit {
                members: vec!["ds-9".to_string()],
            },
        )
        .unwrap()
        .with_session(3);
        let reply = coordinator
            .request(&target, init, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!reply.is_ok());

        let start = Message::from_body(coordinator.next_id(), Body::KeyExchangeStart)
            .unwrap()
            .with_session(4);
        let reply = coordinator
            .request(&target, start, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!reply.is_ok());

        coordinator.shutdown();
        custodians[0].shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_custodian_ring_and_sessionless_request() {
        let (config, custodians) = network(1).await;
        let coordinator = coordinator(&config);
        let target = config.components().remove(0);

        let stray = Message::from_body(
            coordinator.next_id(),
            Body::DataRequest {
                ids: vec!["shared".into()],
            },
        )
        .unwrap();
        let reply = coordinator
            .request(&target, stray, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!reply.is_ok());

        let init = broadcast(
            &coordinator,
            &config,
            Body::KeyExchangeInit {
                members: vec!["ds-1".into()],
            },
            5,
        )
        .await;
        assert!(init[0].is_ok());
        let proof = broadcast(&coordinator, &config, Body::KeyExchangeStart, 5).await;
        assert!(proof[0].is_ok());
        assert_eq!(proof[0].data.as_ref().unwrap().as_str().unwrap().len(), 96);

        coordinator.shutdown();
        custodians[0].shutdown();
    }

    /// Start `count` custodians on ephemeral ports
    async fn network(count: usize) -> (NetworkConfig, Vec<Arc<CustodianServer<MemoryStore>>>) {
        network_in(count, GroupKind::Modp2048).await
    }

    async fn network_in(count: usize, group: GroupKind) -> (NetworkConfig, Vec<Arc<CustodianServer<MemoryStore>>>) {
        let mut listeners = Vec::new();
        let mut servers = Vec::new();
        for i in 1..=count {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            servers.push(DataServer::new(format!("ds-{}", i), listener.local_addr().unwrap()));
            listeners.push(listener);
        }
        let config = NetworkConfig::default()
            .with_data_servers(servers)
            .with_group(group)
            .with_timing(timing());

        let mut custodians = Vec::new();
        for (i, listener) in listeners.into_iter().enumerate() {
            let custodian = Arc::new(
                CustodianBuilder::new(config.clone(), format!("ds-{}", i + 1))
                    .build(store(&["shared", &format!("own-{}", i)]))
                    .unwrap(),
            );
            let running = custodian.clone();
            tokio::spawn(async move { running.serve(listener).await });
            custodians.push(custodian);
        }
        (config, custodians)
    }

    #[test]
    fn test_builder_rejects_unknown_id() {
        let config = NetworkConfig::local(2, 47000);
        let result = CustodianBuilder::new(config, "ds-5").build(MemoryStore::new());
        assert!(matches!(result, Err(CustodianError::UnknownDataServer(_))));
    }
}
