//! Client-facing side of the coordinator
//!
//! External clients connect without a handshake, send
//! USER_DATA_REQUEST frames and receive the joined records as the
//! correlated RESPONSE_OK, or RESPONSE_FAILED with the error text.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use spasm_core::constants::RECV_CHUNK_SIZE;
use spasm_core::{
    parse_conditions, spawn_supervised, Body, ByteBuffer, Counter, Error, GuardedMap, IdGenerator,
    Message, MessageType, Signal, StatusLog,
};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::engine::{JoinedRecord, QueryOutcome, UserQuery};
use crate::error::{CoordinatorError, Result};

pub struct LoopbackServer {
    queries: mpsc::UnboundedSender<UserQuery>,
    clients: GuardedMap<u64, mpsc::UnboundedSender<Message>>,
    client_ids: Counter,
    signal: Signal,
    status: StatusLog,
}

impl LoopbackServer {
    /// Server feeding accepted queries into `queries`
    pub fn new(queries: mpsc::UnboundedSender<UserQuery>, signal: &Signal, status: StatusLog) -> Arc<Self> {
        Arc::new(Self {
            queries,
            clients: GuardedMap::new(),
            client_ids: Counter::new(0),
            signal: signal.derive(),
            status,
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Accept clients until the signal fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> spasm_core::Result<()> {
        let local = listener.local_addr()?;
        self.status.post(
            "NETWORK-LOOPBACK",
            format!("Started Loopback Server. Listening on {}.", local),
        );
        loop {
            tokio::select! {
                _ = self.signal.triggered() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        spawn_supervised(
                            format!("loopback client {}", addr),
                            self.signal.clone(),
                            self.clone().serve_client(stream, addr),
                        );
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept loopback client"),
                },
            }
        }
        self.status.post("NETWORK-LOOPBACK", "Closed Loopback Server.");
        Ok(())
    }

    /// Deliver engine outcomes to their clients until the signal fires
    pub async fn dispatch(self: Arc<Self>, mut results: mpsc::UnboundedReceiver<QueryOutcome>) -> spasm_core::Result<()> {
        while let Ok(Some(outcome)) = self.signal.guard(results.recv()).await {
            let reply = match outcome.result {
                Ok(rows) => {
                    self.status.post(
                        "LOOPBACK",
                        format!("Returning result of `{}`: {} records.", outcome.request.id, rows.len()),
                    );
                    outcome.request.generate_reply(true, Some(serde_json::to_value(rows)?))
                }
                Err(reason) => outcome
                    .request
                    .generate_reply(false, Some(Value::String(reason))),
            };
            let delivered = self
                .clients
                .get_cloned(&outcome.client)
                .is_some_and(|client| client.send(reply).is_ok());
            if !delivered {
                self.status.error(
                    "LOOPBACK",
                    format!("Client {} left before its result was ready.", outcome.client),
                );
            }
        }
        Ok(())
    }

    async fn serve_client(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> spasm_core::Result<()> {
        let client = self.client_ids.inc();
        self.status.post(
            "NETWORK-LOOPBACK",
            format!("Start of connection with client {} at {}.", client, addr),
        );
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.insert(client, tx.clone());
        let connection = self.signal.derive();
        let writing = tokio::spawn(write_loop(writer, rx, connection.clone()));

        let mut buffer = ByteBuffer::new();
        let mut chunk = vec![0u8; RECV_CHUNK_SIZE];
        let result: spasm_core::Result<()> = async {
            loop {
                let read = match connection.guard(reader.read(&mut chunk)).await {
                    Ok(read) => read?,
                    Err(_) => return Ok(()),
                };
                if read == 0 {
                    return Ok(());
                }
                buffer.append(&chunk[..read]);
                for frame in buffer.drain_frames()? {
                    match frame {
                        Ok(message) => self.handle(client, &tx, message),
                        Err(rejected) => {
                            self.status.error(
                                "LOOPBACK",
                                format!("Rejected request {} of client {}: {}", rejected.id, client, rejected.error),
                            );
                            let _ = tx.send(rejected.reply());
                        }
                    }
                }
            }
        }
        .await;

        self.clients.remove(&client);
        connection.trigger();
        let _ = writing.await;
        match result {
            Ok(()) => {}
            Err(e) => self.status.error("LOOPBACK", format!("Client {} dropped: {}", client, e)),
        }
        self.status.post(
            "NETWORK-LOOPBACK",
            format!("End of connection with client {}.", client),
        );
        Ok(())
    }

    fn handle(&self, client: u64, tx: &mpsc::UnboundedSender<Message>, message: Message) {
        tracing::debug!(client, message = %message, "Loopback request");
        let refuse = |reason: String| {
            let _ = tx.send(message.generate_reply(false, Some(Value::String(reason))));
        };
        match message.kind {
            MessageType::Ping => {
                let _ = tx.send(message.generate_reply(true, None));
            }
            MessageType::UserDataRequest => {
                let conditions = message.data.clone().unwrap_or_else(|| Value::Object(Default::default()));
                let query = UserQuery {
                    client,
                    request: message.clone(),
                    conditions,
                };
                if self.queries.send(query).is_err() {
                    refuse("The query engine is not running.".to_string());
                }
            }
            kind => refuse(format!("Unsupported request type '{}'.", kind)),
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Message>, signal: Signal) {
    while let Ok(Some(message)) = signal.guard(rx.recv()).await {
        if let Err(e) = message.write_to(&mut writer).await {
            tracing::warn!(error = %e, "Loopback write failed");
            return;
        }
    }
}

/// Client of the loopback server
pub struct LoopbackClient {
    stream: TcpStream,
    ids: IdGenerator,
    timeout: Duration,
}

impl LoopbackClient {
    pub async fn connect(address: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::timeout(format!("Could not connect to {} in time.", address)))??;
        Ok(Self {
            stream,
            ids: IdGenerator::new(),
            timeout,
        })
    }

    pub async fn ping(&mut self) -> Result<()> {
        let reply = self.exchange(Message::request(&self.ids, MessageType::Ping, None)).await?;
        if !reply.is_ok() {
            return Err(CoordinatorError::QueryFailed("ping refused".into()));
        }
        Ok(())
    }

    /// Parse `text` (one `<attribute><operator><value>` per line) and run it
    pub async fn query(&mut self, text: &str) -> Result<Vec<JoinedRecord>> {
        let conditions = parse_conditions(text)?;
        let request = Message::from_body(self.ids.next_id(), Body::UserDataRequest { conditions })?;
        let reply = self.exchange(request).await?;
        if !reply.is_ok() {
            let reason = reply
                .data
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or("no detail")
                .to_string();
            return Err(CoordinatorError::QueryFailed(reason));
        }
        let rows = reply.data.unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(rows)?)
    }

    /// Send `request` and wait for the reply with its id
    async fn exchange(&mut self, request: Message) -> Result<Message> {
        request.write_to(&mut self.stream).await?;
        let bounded = Signal::new().derive_with_timeout(self.timeout);
        loop {
            let reply = Message::read_from(&mut self.stream, Some(&bounded)).await?;
            if reply.is_response() && reply.id == request.id {
                return Ok(reply);
            }
            tracing::debug!(message = %reply, "Skipping unrelated loopback frame");
        }
    }
}
