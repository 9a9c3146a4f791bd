//! Pseudonymized read path
//!
//! Rows leave the custodian labelled with `SHA3-384(salt || id)` only.
//! The salt is the per-session shared secret, so labels from two
//! custodians in the same session join, and labels from different
//! sessions do not.

use parking_lot::Mutex;
use spasm_core::{Error, Record, Result, SharedSecret, Signal, StatusLog};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::store::RecordStore;

/// `(label, record)` rows sorted by label
pub type LabelledRows = Vec<(String, Record)>;

struct ReadRequest {
    ids: Vec<String>,
    salt: SharedSecret,
    reply: oneshot::Sender<LabelledRows>,
}

/// Record store behind a reader/writer lock, with a request queue
pub struct DataComponent<S> {
    store: RwLock<S>,
    status: StatusLog,
    requests: mpsc::UnboundedSender<ReadRequest>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<ReadRequest>>>,
}

impl<S: RecordStore> DataComponent<S> {
    pub fn new(store: S, status: StatusLog) -> Self {
        let (requests, queue) = mpsc::unbounded_channel();
        Self {
            store: RwLock::new(store),
            status,
            requests,
            queue: Mutex::new(Some(queue)),
        }
    }

    /// Label every held id in `ids` under `salt`.
    ///
    /// Ids not held are skipped. Runs under the shared read lock.
    pub async fn read(&self, ids: &[String], salt: &SharedSecret) -> LabelledRows {
        let store = self.store.read().await;
        self.status.post("DATA", format!("Fetching {} ids.", ids.len()));
        let labeller = salt.pseudonymizer();
        let mut rows: LabelledRows = ids
            .iter()
            .filter_map(|id| store.get(id).map(|record| (labeller.label(id), record)))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        self.status.post("DATA", "Done fetching.");
        rows
    }

    /// Apply `mutate` with no concurrent readers
    pub async fn write<R>(&self, mutate: impl FnOnce(&mut S) -> R) -> R {
        let mut store = self.store.write().await;
        self.status.post("DATA", "Writing...");
        let result = mutate(&mut store);
        self.status.post("DATA", "Done writing.");
        result
    }

    /// Queue a read for the worker and wait for its rows
    pub async fn request(&self, ids: Vec<String>, salt: SharedSecret) -> Result<LabelledRows> {
        let (reply, rows) = oneshot::channel();
        self.requests
            .send(ReadRequest { ids, salt, reply })
            .map_err(|_| Error::Cancelled)?;
        rows.await.map_err(|_| Error::Cancelled)
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    /// Worker draining the request queue until `signal` fires
    pub async fn run(&self, signal: Signal) -> Result<()> {
        let mut queue = self
            .queue
            .lock()
            .take()
            .ok_or_else(|| Error::protocol("Data worker is already running."))?;
        self.status.post("DATA", "Started database, waiting for requests.");

        while let Ok(Some(request)) = signal.guard(queue.recv()).await {
            let rows = self.read(&request.ids, &request.salt).await;
            // The requester may have given up
            let _ = request.reply.send(rows);
        }

        let mut lost = 0;
        while queue.try_recv().is_ok() {
            lost += 1;
        }
        self.status.post(
            "DATA",
            format!("Closed database. {} requests lost.", lost),
        );
        Ok(())
    }
}
