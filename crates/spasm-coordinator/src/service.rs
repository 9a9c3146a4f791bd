//! Coordinator service: query engine, custodian links and loopback server

use std::sync::Arc;

use spasm_core::{spawn_supervised, NetworkComponent, NetworkConfig, Signal, StatusLog};
use spasm_net::PeerServer;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::engine::{BackendHandler, BaseData, QueryEngine};
use crate::error::Result;
use crate::loopback::LoopbackServer;

pub struct CoordinatorService {
    config: NetworkConfig,
    engine: Arc<QueryEngine>,
    signal: Signal,
    status: StatusLog,
}

impl CoordinatorService {
    pub fn builder(config: NetworkConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn shutdown(&self) {
        self.signal.trigger();
    }

    /// Run until shutdown, accepting clients on `listener`
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            custodians = self.config.data_servers.len(),
            group = ?self.config.group,
            "Starting coordinator"
        );
        let (queries, inbound) = mpsc::unbounded_channel();
        let (results, outbound) = mpsc::unbounded_channel();
        let loopback = LoopbackServer::new(queries, &self.signal, self.status.clone());

        let peer = self.engine.peer().clone();
        let maintenance = spawn_supervised("maintenance", self.signal.clone(), peer.run_maintenance());
        // The coordinator lives as long as its engine
        let engine = tokio::spawn({
            let engine = self.engine.clone();
            let signal = self.signal.clone();
            let status = self.status.clone();
            async move {
                if let Err(e) = engine.run(inbound, results).await {
                    status.error("BACKEND", e.to_string());
                }
                signal.trigger();
            }
        });
        let dispatcher = spawn_supervised("dispatcher", self.signal.clone(), loopback.clone().dispatch(outbound));

        let served = loopback.serve(listener).await;
        self.signal.trigger();
        let _ = tokio::join!(maintenance, engine, dispatcher);
        self.status.post("BACKEND", "Coordinator stopped.");
        served.map_err(Into::into)
    }

    /// Bind the configured loopback address and serve
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.loopback_address).await?;
        self.serve(listener).await
    }
}

/// Builder for [`CoordinatorService`]
pub struct CoordinatorBuilder {
    config: NetworkConfig,
    base_data: BaseData,
    status: Option<StatusLog>,
    signal: Option<Signal>,
}

impl CoordinatorBuilder {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            base_data: BaseData::new(),
            status: None,
            signal: None,
        }
    }

    /// Candidate pool that analysis queries sample from
    pub fn base_data(mut self, base_data: BaseData) -> Self {
        self.base_data = base_data;
        self
    }

    pub fn status(mut self, status: StatusLog) -> Self {
        self.status = Some(status);
        self
    }

    /// Parent shutdown signal
    pub fn signal(mut self, signal: &Signal) -> Self {
        self.signal = Some(signal.derive());
        self
    }

    pub fn build(self) -> Result<CoordinatorService> {
        self.config.validate()?;
        let signal = self.signal.unwrap_or_default();
        let status = self.status.unwrap_or_else(|| StatusLog::new("coordinator"));
        let peer = PeerServer::builder(NetworkComponent::CoordinatorBackend, Arc::new(BackendHandler))
            .peers(self.config.components())
            .timing(self.config.timing.clone())
            .signal(&signal)
            .status(status.clone())
            .build();
        let engine = Arc::new(QueryEngine::new(peer, &self.config, self.base_data, status.clone()));
        Ok(CoordinatorService {
            config: self.config,
            engine,
            signal,
            status,
        })
    }
}
