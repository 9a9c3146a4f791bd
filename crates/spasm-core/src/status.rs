//! Human-readable status feed
//!
//! Each process role posts short categorized lines (`[NETWORK] ...`,
//! `[KEY EXCHANGE] ...`). Every line goes to `tracing` under the
//! `spasm::status` target; an optional subscriber channel receives a copy
//! for display. Lines never contain record contents or raw ids.

use std::sync::Arc;

use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct StatusLog {
    role: Arc<str>,
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl StatusLog {
    /// Feed that only logs through `tracing`
    pub fn new(role: impl Into<Arc<str>>) -> Self {
        Self {
            role: role.into(),
            tx: None,
        }
    }

    /// Feed that also copies each line to the returned receiver
    pub fn with_channel(role: impl Into<Arc<str>>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Self {
            role: role.into(),
            tx: Some(tx),
        };
        (log, rx)
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn post(&self, category: &str, line: impl AsRef<str>) {
        let line = format!("[{}] {}", category, line.as_ref());
        tracing::info!(target: "spasm::status", role = %self.role, "{}", line);
        if let Some(tx) = &self.tx {
            // A closed display must not affect the caller
            let _ = tx.send(line);
        }
    }

    pub fn error(&self, category: &str, line: impl AsRef<str>) {
        let line = format!("[ERROR-{}] {}", category, line.as_ref());
        tracing::warn!(target: "spasm::status", role = %self.role, "{}", line);
        if let Some(tx) = &self.tx {
            let _ = tx.send(line);
        }
    }
}
