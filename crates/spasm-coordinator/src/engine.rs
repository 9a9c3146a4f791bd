//! Distributed query engine
//!
//! Per query the engine samples ids from its own candidate pool, opens a
//! session on every custodian, runs the ring key exchange, checks that
//! all proofs agree and joins the returned rows by label.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use serde_json::Value;
use spasm_core::{
    conditions_from_struct, filter_ids, Body, Conditions, Counter, Error, Message, MessageType,
    NetworkComponent, NetworkConfig, QueryConfig, Record, StatusLog, TimingConfig,
};
use spasm_net::{async_trait, PeerServer, SessionContext, SessionHandler};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::{CoordinatorError, Result};
use crate::metrics;

/// One subject's records, keyed by custodian id
pub type JoinedRecord = BTreeMap<String, Value>;

/// Fan-out responses in configuration order
pub type FanOut = Vec<(NetworkComponent, Message)>;

/// A query accepted from an external client
#[derive(Debug, Clone)]
pub struct UserQuery {
    /// Loopback client that sent it
    pub client: u64,
    pub request: Message,
    /// Condition struct as received
    pub conditions: Value,
}

/// Outcome of a [`UserQuery`], routed back to its client
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub client: u64,
    pub request: Message,
    pub result: std::result::Result<Vec<JoinedRecord>, String>,
}

/// An analysis query before it is flattened for the client
#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    /// Cohort below the anonymity floor; nothing was sent to custodians
    Refused,
    /// Joined rows, possibly none
    Joined(Vec<JoinedRecord>),
}

impl Analysis {
    pub fn into_records(self) -> Vec<JoinedRecord> {
        match self {
            Analysis::Refused => Vec::new(),
            Analysis::Joined(rows) => rows,
        }
    }
}

/// Metrics label for a finished query
fn outcome_label(result: &Result<Analysis>) -> &'static str {
    match result {
        Ok(Analysis::Refused) => metrics::OUTCOME_REFUSED,
        Ok(Analysis::Joined(rows)) if rows.is_empty() => metrics::OUTCOME_EMPTY,
        Ok(Analysis::Joined(_)) => metrics::OUTCOME_OK,
        Err(_) => metrics::OUTCOME_ERROR,
    }
}

/// Candidate pool of the coordinator: id -> record
pub type BaseData = BTreeMap<String, Record>;

/// Load a candidate pool from a JSON object of `id -> record`
pub fn load_base_data(path: impl AsRef<Path>) -> Result<BaseData> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let value: Value = serde_json::from_str(&content)?;
    let object = value.as_object().ok_or_else(|| {
        CoordinatorError::BaseData(format!("{} must hold an object of records", path.as_ref().display()))
    })?;
    object
        .iter()
        .map(|(id, record)| {
            record
                .as_object()
                .cloned()
                .map(|record| (id.clone(), record))
                .ok_or_else(|| CoordinatorError::BaseData(format!("record `{}` is not an object", id)))
        })
        .collect()
}

/// The coordinator never serves sessions; custodians only answer it
pub(crate) struct BackendHandler;

#[async_trait]
impl SessionHandler for BackendHandler {
    async fn handle_message(&self, _server: &Arc<PeerServer>, _sender: &NetworkComponent, message: Message) -> spasm_core::Result<()> {
        Err(Error::protocol(format!(
            "The coordinator does not accept '{}' requests.",
            message.kind
        )))
    }

    async fn run_session(&self, _server: Arc<PeerServer>, session: SessionContext) -> spasm_core::Result<()> {
        Err(Error::protocol(format!(
            "The coordinator does not host sessions ({}).",
            session.id()
        )))
    }
}

pub struct QueryEngine {
    peer: Arc<PeerServer>,
    custodians: Vec<NetworkComponent>,
    base_data: BaseData,
    query: QueryConfig,
    timing: TimingConfig,
    sessions: Counter,
    /// Key exchanges failed in a row
    exchange_failures: Counter,
    status: StatusLog,
}

impl QueryEngine {
    pub fn new(peer: Arc<PeerServer>, config: &NetworkConfig, base_data: BaseData, status: StatusLog) -> Self {
        Self {
            peer,
            custodians: config.components(),
            base_data,
            query: config.query.clone(),
            timing: config.timing.clone(),
            sessions: Counter::new(0),
            exchange_failures: Counter::new(0),
            status,
        }
    }

    pub fn peer(&self) -> &Arc<PeerServer> {
        &self.peer
    }

    pub fn custodians(&self) -> &[NetworkComponent] {
        &self.custodians
    }

    pub fn base_data(&self) -> &BaseData {
        &self.base_data
    }

    /// Connect to every custodian; one that does not answer in time is fatal
    pub async fn connect_all(&self) -> Result<()> {
        for custodian in &self.custodians {
            self.peer
                .connect_and_wait(custodian, self.timing.request_timeout())
                .await
                .inspect_err(|e| {
                    self.status.error("NETWORK", format!("Could not connect to {}: {}", custodian, e));
                })?;
            self.status.post("NETWORK", format!("Connected to data server {}.", custodian));
        }
        metrics::set_custodians_connected(self.custodians.len());
        self.status.post("NETWORK", "Connected to all data servers.");
        Ok(())
    }

    pub fn disconnect_all(&self) {
        for custodian in &self.custodians {
            if self.peer.disconnect(custodian) {
                self.status.post("NETWORK", format!("Disconnected from data server {}.", custodian));
            }
        }
        metrics::set_custodians_connected(0);
    }

    /// Send `message` to every custodian concurrently.
    ///
    /// Returns `None` unless every custodian answered within the request
    /// timeout; partial results are discarded.
    pub async fn request_all(&self, message: Message) -> Option<FanOut> {
        let started = Instant::now();
        let kind = message.kind.name();
        let timeout = self.timing.request_timeout();

        let mut requests = JoinSet::new();
        for (index, custodian) in self.custodians.iter().enumerate() {
            let peer = self.peer.clone();
            let custodian = custodian.clone();
            let message = message.clone();
            requests.spawn(async move {
                let response = peer.request(&custodian, message, timeout).await;
                (index, custodian, response)
            });
        }

        let mut responses = Vec::with_capacity(self.custodians.len());
        let mut complete = true;
        while let Some(joined) = requests.join_next().await {
            match joined {
                Ok((index, custodian, Ok(response))) => {
                    tracing::debug!(peer = %custodian, response = %response, "Fan-out response");
                    responses.push((index, custodian, response));
                }
                Ok((_, custodian, Err(e))) => {
                    self.status.error("NETWORK", format!("No response from {}: {}", custodian, e));
                    complete = false;
                }
                Err(e) => {
                    self.status.error("NETWORK", format!("Request worker failed: {}", e));
                    complete = false;
                }
            }
        }

        if !complete || responses.len() < self.custodians.len() {
            metrics::record_fanout(kind, metrics::OUTCOME_INCOMPLETE, started.elapsed());
            return None;
        }
        metrics::record_fanout(kind, metrics::OUTCOME_OK, started.elapsed());
        responses.sort_by_key(|(index, _, _)| *index);
        Some(
            responses
                .into_iter()
                .map(|(_, custodian, response)| (custodian, response))
                .collect(),
        )
    }

    /// Fan out `body` in `session_id` and require a RESPONSE_OK from everyone
    async fn request_all_ok(&self, body: Body, session_id: u64) -> Result<FanOut> {
        let kind = body.kind();
        let message = Message::from_body(self.peer.next_id(), body)?.with_session(session_id);
        let responses = self
            .request_all(message)
            .await
            .ok_or_else(|| CoordinatorError::IncompleteFanOut(kind.name().to_string()))?;
        if let Some((custodian, response)) = responses.iter().find(|(_, r)| !r.is_ok()) {
            let detail = response
                .data
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or("no detail");
            return Err(CoordinatorError::QueryFailed(format!(
                "{} refused {}: {}",
                custodian, kind, detail
            )));
        }
        Ok(responses)
    }

    /// Run the ring exchange of `session_id` and return the agreed proof.
    ///
    /// Disagreeing proofs mean the ring is broken and stop the coordinator.
    pub async fn run_key_exchange(&self, session_id: u64) -> Result<String> {
        self.status.post("KEY EXCHANGE", "Key exchange started.");
        let members = self
            .custodians
            .iter()
            .map(|custodian| custodian.key().to_string())
            .collect();

        let outcome = async {
            self.request_all_ok(Body::KeyExchangeInit { members }, session_id).await?;
            self.request_all_ok(Body::KeyExchangeStart, session_id).await
        }
        .await;
        let responses = match outcome {
            Ok(responses) => responses,
            Err(e) => {
                metrics::record_key_exchange(metrics::OUTCOME_ERROR);
                self.note_exchange_failure();
                return Err(e);
            }
        };

        let mut proof: Option<&str> = None;
        for (custodian, response) in &responses {
            let Some(reported) = response.data.as_ref().and_then(Value::as_str) else {
                metrics::record_key_exchange(metrics::OUTCOME_ERROR);
                self.note_exchange_failure();
                return Err(Error::key_exchange(format!("{} sent no proof.", custodian)).into());
            };
            match proof {
                Some(expected) if expected != reported => {
                    self.status.error(
                        "KEY EXCHANGE",
                        format!("Key exchange failed: different secret proofs \"{}\" and \"{}\".", expected, reported),
                    );
                    metrics::record_key_exchange(metrics::OUTCOME_MISMATCH);
                    self.peer.shutdown();
                    return Err(Error::key_exchange("Inconsistent proofs.").into());
                }
                _ => proof = Some(reported),
            }
        }

        let proof = proof.unwrap_or_default().to_string();
        self.exchange_failures.set(0);
        metrics::record_key_exchange(metrics::OUTCOME_OK);
        self.status.post("KEY EXCHANGE", format!("Key exchange done. proof: \"{}\".", proof));
        Ok(proof)
    }

    /// Count a failed key exchange and stop once too many failed in a row
    fn note_exchange_failure(&self) {
        let failures = self.exchange_failures.inc();
        let limit = self.query.max_key_exchange_failures as u64;
        if limit > 0 && failures >= limit {
            self.status.error(
                "KEY EXCHANGE",
                format!("{} key exchanges failed in a row, stopping.", failures),
            );
            self.peer.shutdown();
        }
    }

    /// Fetch `ids` from every custodian under a fresh session and join by label
    pub async fn query_ids(&self, ids: &[String]) -> Result<Vec<JoinedRecord>> {
        let session_id = self.next_session();
        let result = self.query_session(session_id, ids).await;
        if result.is_err() {
            self.end_session(session_id);
        }
        result
    }

    async fn query_session(&self, session_id: u64, ids: &[String]) -> Result<Vec<JoinedRecord>> {
        self.run_key_exchange(session_id).await?;
        let responses = self
            .request_all_ok(Body::DataRequest { ids: ids.to_vec() }, session_id)
            .await?;

        let mut merged: BTreeMap<String, JoinedRecord> = BTreeMap::new();
        for (custodian, response) in responses {
            let rows = parse_rows(&response)?;
            self.status.post("DATA", format!("{} rows from {}.", rows.len(), custodian));
            for (label, record) in rows {
                merged
                    .entry(label)
                    .or_default()
                    .insert(custodian.key().to_string(), record);
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Filter the candidate pool and query a random sample of it.
    ///
    /// Cohorts below the anonymity floor are refused with an empty result.
    pub async fn analysis_query(&self, conditions: Option<&Conditions>) -> Result<Vec<JoinedRecord>> {
        self.analyse(conditions).await.map(Analysis::into_records)
    }

    /// Like [`analysis_query`](Self::analysis_query), keeping refusals apart
    /// from empty joins
    pub async fn analyse(&self, conditions: Option<&Conditions>) -> Result<Analysis> {
        let cohort = filter_ids(&self.base_data, conditions);
        if cohort.len() < self.query.anonymity_floor {
            self.status.post(
                "QUERY",
                format!(
                    "Refused query: cohort of {} is below the minimum of {}.",
                    cohort.len(),
                    self.query.anonymity_floor
                ),
            );
            return Ok(Analysis::Refused);
        }
        let sample: Vec<String> = {
            let mut rng = rand::thread_rng();
            cohort
                .choose_multiple(&mut rng, self.query.sample_size.min(cohort.len()))
                .cloned()
                .collect()
        };
        self.query_ids(&sample).await.map(Analysis::Joined)
    }

    /// Serve queries from `inbound` until the server stops, posting each
    /// outcome to `results`
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<UserQuery>,
        results: mpsc::UnboundedSender<QueryOutcome>,
    ) -> Result<()> {
        let signal = self.peer.signal().clone();
        let connected = self.connect_all().await;
        if connected.is_ok() {
            while let Ok(Some(query)) = signal.guard(inbound.recv()).await {
                let outcome = self.handle(query).await;
                if results.send(outcome).is_err() {
                    tracing::warn!("Result queue closed, dropping query result");
                }
            }
        }
        self.disconnect_all();
        connected
    }

    async fn handle(&self, query: UserQuery) -> QueryOutcome {
        let started = Instant::now();
        metrics::record_query_start();

        let result = match conditions_from_struct(&query.conditions) {
            Ok(conditions) => self.analyse(Some(&conditions)).await,
            Err(e) => Err(e.into()),
        };
        metrics::record_query_end();
        metrics::record_query(outcome_label(&result), started.elapsed());

        if let Err(e) = &result {
            self.status.error("BACKEND", format!("Query {} failed: {}", query.request.id, e));
        } else {
            self.status.post("BACKEND", format!("Query {} done.", query.request.id));
        }
        QueryOutcome {
            client: query.client,
            request: query.request,
            result: result.map(Analysis::into_records).map_err(|e| e.to_string()),
        }
    }

    fn next_session(&self) -> u64 {
        loop {
            let id = self.sessions.inc();
            if id != spasm_core::constants::NO_SESSION {
                return id;
            }
        }
    }

    /// Ask every custodian to drop `session_id`, without waiting
    fn end_session(&self, session_id: u64) {
        for custodian in &self.custodians {
            let end = Message::new(MessageType::EndSession, self.peer.next_id(), None).with_session(session_id);
            self.peer.send(custodian, end);
        }
    }
}

/// Rows of a DATA_REQUEST reply: `[[label, record], ...]`
fn parse_rows(response: &Message) -> spasm_core::Result<Vec<(String, Value)>> {
    let malformed = || Error::protocol("Malformed data response.");
    let rows = response
        .data
        .as_ref()
        .and_then(Value::as_array)
        .ok_or_else(malformed)?;
    rows.iter()
        .map(|row| match row.as_array().map(Vec::as_slice) {
            Some([Value::String(label), record]) => Ok((label.clone(), record.clone())),
            _ => Err(malformed()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spasm_core::{parse_conditions, DataServer};
    use std::net::SocketAddr;
    use std::time::Duration;

    fn base_data(ages: &[(&str, i64)]) -> BaseData {
        ages.iter()
            .map(|(id, age)| (id.to_string(), json!({ "age": age }).as_object().cloned().unwrap()))
            .collect()
    }

    fn fast_timing() -> TimingConfig {
        TimingConfig {
            poll_interval_ms: 5,
            request_timeout_ms: 200,
            connection_update_ms: 50,
            session_timeout_ms: 1000,
        }
    }

    fn engine(custodians: Vec<DataServer>, base: BaseData, query: QueryConfig) -> QueryEngine {
        let config = NetworkConfig::default()
            .with_data_servers(custodians)
            .with_timing(fast_timing())
            .with_query(query);
        let peer = PeerServer::builder(NetworkComponent::CoordinatorBackend, Arc::new(BackendHandler))
            .peers(config.components())
            .timing(config.timing.clone())
            .build();
        QueryEngine::new(peer, &config, base, StatusLog::new("test"))
    }

    /// Engine whose custodian address has no listener
    fn offline_engine(base: BaseData) -> QueryEngine {
        let unreachable = SocketAddr::from(([127, 0, 0, 1], 9));
        engine(vec![DataServer::new("ds-1", unreachable)], base, QueryConfig::default())
    }

    /// Custodian stand-in that accepts the handshake and then never answers
    async fn silent_custodian() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let hello = Message::read_from(&mut stream, None).await?;
                    hello.generate_reply(true, None).write_to(&mut stream).await?;
                    while Message::read_from(&mut stream, None).await.is_ok() {}
                    Ok::<(), Error>(())
                });
            }
        });
        addr
    }

    /// Custodian stand-in that answers PING and refuses everything else
    async fn live_custodian() -> (Arc<PeerServer>, SocketAddr) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let identity = NetworkComponent::from(DataServer::new("ds-1", addr));
        let server = PeerServer::builder(identity, Arc::new(BackendHandler))
            .peers([NetworkComponent::CoordinatorBackend])
            .timing(fast_timing())
            .build();
        server.spawn(listener);
        (server, addr)
    }

    #[tokio::test]
    async fn test_anonymity_floor_refuses_small_cohorts() {
        let engine = offline_engine(base_data(&[("a", 30), ("b", 40), ("c", 50), ("d", 60), ("e", 70)]));

        let old = parse_conditions("age>=50").unwrap();
        assert!(engine.analysis_query(Some(&old)).await.unwrap().is_empty());

        let small = offline_engine(base_data(&[("a", 30), ("b", 40)]));
        assert!(small.analysis_query(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fanout_to_unreachable_custodian_is_incomplete() {
        let engine = offline_engine(base_data(&[]));
        let ping = Message::new(MessageType::Ping, engine.peer().next_id(), None);
        assert!(engine.request_all(ping).await.is_none());

        let result = engine.query_ids(&["a".to_string()]).await;
        assert!(matches!(result, Err(CoordinatorError::IncompleteFanOut(_))));
    }

    #[tokio::test]
    async fn test_fanout_with_one_silent_custodian_is_incomplete() {
        let (live, live_addr) = live_custodian().await;
        let silent_addr = silent_custodian().await;
        let engine = engine(
            vec![DataServer::new("ds-1", live_addr), DataServer::new("ds-2", silent_addr)],
            base_data(&[]),
            QueryConfig::default(),
        );
        engine.connect_all().await.unwrap();

        let only_live = Message::new(MessageType::Ping, engine.peer().next_id(), None);
        let reply = engine
            .peer()
            .request(&engine.custodians()[0], only_live, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reply.is_ok());

        let ping = Message::new(MessageType::Ping, engine.peer().next_id(), None);
        assert!(engine.request_all(ping).await.is_none());

        let result = engine.query_ids(&["a".to_string()]).await;
        assert!(matches!(result, Err(CoordinatorError::IncompleteFanOut(_))));

        engine.peer().shutdown();
        live.shutdown();
    }

    #[tokio::test]
    async fn test_repeated_key_exchange_failures_stop_the_engine() {
        let unreachable = SocketAddr::from(([127, 0, 0, 1], 9));
        let query = QueryConfig {
            max_key_exchange_failures: 2,
            ..QueryConfig::default()
        };
        let engine = engine(vec![DataServer::new("ds-1", unreachable)], base_data(&[]), query);

        assert!(engine.query_ids(&["a".to_string()]).await.is_err());
        assert!(!engine.peer().signal().is_triggered());
        assert!(engine.query_ids(&["a".to_string()]).await.is_err());
        assert!(engine.peer().signal().is_triggered());
    }

    #[tokio::test]
    async fn test_key_exchange_failures_can_be_tolerated() {
        let unreachable = SocketAddr::from(([127, 0, 0, 1], 9));
        let query = QueryConfig {
            max_key_exchange_failures: 0,
            ..QueryConfig::default()
        };
        let engine = engine(vec![DataServer::new("ds-1", unreachable)], base_data(&[]), query);
        for _ in 0..3 {
            assert!(engine.query_ids(&["a".to_string()]).await.is_err());
        }
        assert!(!engine.peer().signal().is_triggered());
    }

    #[tokio::test]
    async fn test_refusal_is_not_an_empty_join() {
        let engine = offline_engine(base_data(&[("a", 30)]));
        let refused = engine.analyse(None).await;
        assert_eq!(refused.as_ref().unwrap(), &Analysis::Refused);
        assert_eq!(outcome_label(&refused), crate::metrics::OUTCOME_REFUSED);

        assert_eq!(outcome_label(&Ok(Analysis::Joined(Vec::new()))), crate::metrics::OUTCOME_EMPTY);
        let mut row = JoinedRecord::new();
        row.insert("ds-1".into(), json!({"age": 30}));
        assert_eq!(outcome_label(&Ok(Analysis::Joined(vec![row]))), crate::metrics::OUTCOME_OK);
        let failed: Result<Analysis> = Err(CoordinatorError::QueryFailed("x".into()));
        assert_eq!(outcome_label(&failed), crate::metrics::OUTCOME_ERROR);
    }

    #[tokio::test]
    async fn test_large_cohort_reaches_the_network() {
        let engine = offline_engine(base_data(&[("a", 30), ("b", 40), ("c", 50), ("d", 60)]));
        let result = engine.analysis_query(None).await;
        assert!(matches!(result, Err(CoordinatorError::IncompleteFanOut(_))));
    }

    #[tokio::test]
    async fn test_connect_all_times_out() {
        let engine = offline_engine(base_data(&[]));
        assert!(engine.connect_all().await.is_err());
    }

    #[test]
    fn test_parse_rows() {
        let reply = Message::new(
            MessageType::ResponseOk,
            1,
            Some(json!([["ab12", {"age": 5}], ["cd34", {}]])),
        );
        let rows = parse_rows(&reply).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "ab12");

        let bad = Message::new(MessageType::ResponseOk, 1, Some(json!([["ab12"]])));
        assert!(parse_rows(&bad).is_err());
    }

    #[test]
    fn test_load_base_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.json");
        std::fs::write(&path, r#"{"p1": {"sex": "F"}, "p2": {"sex": "M"}}"#).unwrap();
        let base = load_base_data(&path).unwrap();
        assert_eq!(base.len(), 2);

        std::fs::write(&path, r#"{"p1": 3}"#).unwrap();
        assert!(matches!(load_base_data(&path), Err(CoordinatorError::BaseData(_))));
    }

    #[tokio::test]
    async fn test_run_reports_failed_connect() {
        let engine = Arc::new(offline_engine(base_data(&[])));
        let (_tx, rx) = mpsc::unbounded_channel();
        let (results, _) = mpsc::unbounded_channel();
        let outcome = tokio::time::timeout(Duration::from_secs(2), engine.run(rx, results)).await;
        assert!(outcome.unwrap().is_err());
    }
}
