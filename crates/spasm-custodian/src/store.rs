//! Record stores

use std::collections::BTreeMap;
use std::path::Path;

use spasm_core::Record;

use crate::error::{CustodianError, Result};

/// Read access to a custodian's records.
///
/// `get` must tolerate concurrent calls; mutation goes through
/// [`crate::DataComponent::write`], which runs exclusively.
pub trait RecordStore: Send + Sync + 'static {
    /// A copy of the record of `id`, if held
    fn get(&self, id: &str) -> Option<Record>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records held in memory, optionally loaded from a JSON file mapping
/// id to record
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: BTreeMap<String, Record>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: BTreeMap<String, Record>) -> Self {
        Self { records }
    }

    /// Load from a JSON object of `id -> record`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        let object = value.as_object().ok_or_else(|| {
            CustodianError::Store(format!(
                "{} must hold an object of records",
                path.as_ref().display()
            ))
        })?;

        let mut records = BTreeMap::new();
        for (id, record) in object {
            let record = record.as_object().ok_or_else(|| {
                CustodianError::Store(format!("record `{}` is not an object", id))
            })?;
            records.insert(id.clone(), record.clone());
        }
        Ok(Self { records })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.records)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn insert(&mut self, id: impl Into<String>, record: Record) -> Option<Record> {
        self.records.insert(id.into(), record)
    }

    pub fn remove(&mut self, id: &str) -> Option<Record> {
        self.records.remove(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, id: &str) -> Option<Record> {
        self.records.get(id).cloned()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
