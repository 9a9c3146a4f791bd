//! Network identities

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity key announced by the coordinator's custodian-facing side
pub const COORDINATOR_BACKEND_KEY: &str = "coordinator-backend";

/// Identity key of the coordinator's client-facing side
pub const COORDINATOR_LOOPBACK_KEY: &str = "coordinator-loopback";

/// A data custodian known to the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataServer {
    pub id: String,
    pub address: SocketAddr,
    /// Opaque public key material, published but not verified
    #[serde(default)]
    pub public_key: Option<String>,
    /// Free-form description (for example `{"name": "Hospital A"}`)
    #[serde(default)]
    pub information: BTreeMap<String, Value>,
}

impl DataServer {
    pub fn new(id: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            id: id.into(),
            address,
            public_key: None,
            information: BTreeMap::new(),
        }
    }

    /// Display name from `information.name`, falling back to the id
    pub fn name(&self) -> &str {
        self.information
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(self.id.as_str())
    }
}

/// Any peer that can hold a connection.
///
/// Equality and hashing go by identity key only.
#[derive(Debug, Clone)]
pub enum NetworkComponent {
    DataServer(Arc<DataServer>),
    CoordinatorBackend,
    CoordinatorLoopback,
}

impl NetworkComponent {
    pub fn key(&self) -> &str {
        match self {
            NetworkComponent::DataServer(server) => &server.id,
            NetworkComponent::CoordinatorBackend => COORDINATOR_BACKEND_KEY,
            NetworkComponent::CoordinatorLoopback => COORDINATOR_LOOPBACK_KEY,
        }
    }

    /// Dialable address; sentinels have none and only ever connect inbound
    pub fn address(&self) -> Option<SocketAddr> {
        match self {
            NetworkComponent::DataServer(server) => Some(server.address),
            _ => None,
        }
    }

    pub fn as_data_server(&self) -> Option<&Arc<DataServer>> {
        match self {
            NetworkComponent::DataServer(server) => Some(server),
            _ => None,
        }
    }
}

impl From<DataServer> for NetworkComponent {
    fn from(server: DataServer) -> Self {
        NetworkComponent::DataServer(Arc::new(server))
    }
}

impl PartialEq for NetworkComponent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for NetworkComponent {}

impl Hash for NetworkComponent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for NetworkComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_by_key() {
        let addr: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let a = NetworkComponent::from(DataServer::new("ds-1", addr));
        let mut moved = DataServer::new("ds-1", "127.0.0.1:9999".parse().unwrap());
        moved.information.insert("name".into(), Value::from("Clinic"));
        let b = NetworkComponent::from(moved);
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b, NetworkComponent::CoordinatorBackend].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_sentinels_have_no_address() {
        assert_eq!(NetworkComponent::CoordinatorBackend.address(), None);
        assert_eq!(NetworkComponent::CoordinatorLoopback.key(), COORDINATOR_LOOPBACK_KEY);
    }

    #[test]
    fn test_name_falls_back_to_id() {
        let mut server = DataServer::new("ds-2", "127.0.0.1:7002".parse().unwrap());
        assert_eq!(server.name(), "ds-2");
        server.information.insert("name".into(), Value::from("Hospital B"));
        assert_eq!(server.name(), "Hospital B");
    }
}
