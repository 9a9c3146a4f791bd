//! Network configuration shared by coordinator and custodians

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::component::{DataServer, NetworkComponent};
use crate::constants;
use crate::diffie_hellman::Group;
use crate::{Error, Result};

/// Protocol version constant
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Key exchange group selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    #[default]
    Modp4096,
    Modp2048,
}

impl GroupKind {
    pub fn group(self) -> &'static Group {
        match self {
            GroupKind::Modp4096 => Group::modp4096(),
            GroupKind::Modp2048 => Group::modp2048(),
        }
    }
}

impl std::str::FromStr for GroupKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "modp4096" => Ok(GroupKind::Modp4096),
            "modp2048" => Ok(GroupKind::Modp2048),
            other => Err(Error::validation(format!("Unknown group `{}`.", other))),
        }
    }
}

/// Poll intervals and bounded waits, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    /// Bounded wait for a single peer response
    pub request_timeout_ms: u64,
    /// Interval of the connection maintenance pass
    pub connection_update_ms: u64,
    /// Lifetime cap of one session
    pub session_timeout_ms: u64,
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connection_update(&self) -> Duration {
        Duration::from_millis(self.connection_update_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: constants::REFRESH_DELAY.as_millis() as u64,
            request_timeout_ms: constants::DEFAULT_TIMEOUT.as_millis() as u64,
            connection_update_ms: constants::CONNECTION_UPDATE_DELAY.as_millis() as u64,
            session_timeout_ms: 30_000,
        }
    }
}

/// Cohort sampling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Ids drawn per analysis query
    pub sample_size: usize,
    /// Minimum qualifying pool size; smaller pools are refused
    pub anonymity_floor: usize,
    /// Consecutive failed key exchanges tolerated before the coordinator
    /// stops; 0 never stops
    pub max_key_exchange_failures: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            sample_size: constants::ID_SAMPLE_SIZE,
            anonymity_floor: constants::STUDY_GROUP_MINIMAL_SIZE,
            max_key_exchange_failures: constants::MAX_KEY_EXCHANGE_FAILURES,
        }
    }
}

/// Description of one deployment: who the custodians are and how to time out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Protocol version
    #[serde(default = "default_version")]
    pub version: String,
    /// Where the coordinator accepts query clients
    #[serde(default = "default_loopback_address")]
    pub loopback_address: SocketAddr,
    /// Known custodians; ring order follows this list
    #[serde(default)]
    pub data_servers: Vec<DataServer>,
    #[serde(default)]
    pub group: GroupKind,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_loopback_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

impl NetworkConfig {
    /// Configuration with `count` custodians `ds-1..` on consecutive local ports
    pub fn local(count: usize, base_port: u16) -> Self {
        let data_servers = (1..=count)
            .map(|i| {
                DataServer::new(
                    format!("ds-{}", i),
                    SocketAddr::from(([127, 0, 0, 1], base_port + i as u16)),
                )
            })
            .collect();
        Self {
            data_servers,
            loopback_address: SocketAddr::from(([127, 0, 0, 1], base_port)),
            ..Self::default()
        }
    }

    pub fn with_data_servers(mut self, data_servers: Vec<DataServer>) -> Self {
        self.data_servers = data_servers;
        self
    }

    pub fn with_group(mut self, group: GroupKind) -> Self {
        self.group = group;
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_query(mut self, query: QueryConfig) -> Self {
        self.query = query;
        self
    }

    pub fn with_loopback_address(mut self, address: SocketAddr) -> Self {
        self.loopback_address = address;
        self
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Reject duplicate custodian ids and zero-length sampling or timing
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for server in &self.data_servers {
            if !seen.insert(server.id.as_str()) {
                return Err(Error::validation(format!(
                    "Duplicate data server id `{}`.",
                    server.id
                )));
            }
        }
        if self.query.sample_size == 0 {
            return Err(Error::validation("Sample size must be positive."));
        }
        if self.timing.poll_interval_ms == 0 || self.timing.request_timeout_ms == 0 {
            return Err(Error::validation("Timing values must be positive."));
        }
        Ok(())
    }

    pub fn data_server(&self, id: &str) -> Option<&DataServer> {
        self.data_servers.iter().find(|server| server.id == id)
    }

    /// Custodians as connection targets, in configuration order
    pub fn components(&self) -> Vec<NetworkComponent> {
        self.data_servers
            .iter()
            .cloned()
            .map(NetworkComponent::from)
            .collect()
    }

    pub fn key_group(&self) -> &'static Group {
        self.group.group()
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            loopback_address: default_loopback_address(),
            data_servers: Vec::new(),
            group: GroupKind::default(),
            timing: TimingConfig::default(),
            query: QueryConfig::default(),
        }
    }
}
