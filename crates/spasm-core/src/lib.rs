//! spasm-core: protocol types for ring-keyed pseudonymized federated queries
//!
//! A coordinator asks several independent data custodians for records of a
//! sampled cohort. Per query, the custodians derive a fresh group secret with
//! a ring Diffie-Hellman exchange and label every row with a keyed hash of
//! its identifier. The coordinator joins rows by label and never sees the
//! secret; custodians never learn which ids other custodians hold.
//!
//! # Threat Model
//!
//! | Party | Learns |
//! |-------|--------|
//! | Coordinator | Joined records, hash labels, proof digests |
//! | Coordinator | NOT the shared salt, NOT the ring intermediate values |
//! | Custodian | The requested id sample, the shared salt |
//! | Custodian | NOT which ids other custodians hold |
//!
//! Transport is unauthenticated: frames are plain length-prefixed JSON.
//! The only integrity check on the ring is the proof digest comparison.
//!
//! This crate holds everything that does not own a socket: the wire codec,
//! concurrency primitives, the ring key exchange state machine, the
//! condition language and configuration.

mod component;
mod conditions;
mod config;
mod diffie_hellman;
mod error;
mod message;
mod status;
mod sync;

pub use component::{DataServer, NetworkComponent, COORDINATOR_BACKEND_KEY, COORDINATOR_LOOPBACK_KEY};
pub use conditions::{
    check, conditions_from_struct, conditions_to_struct, filter_ids, parse_conditions,
    parse_value, satisfies, Bound, BoundType, Condition, Conditions,
};
pub use config::{GroupKind, NetworkConfig, QueryConfig, TimingConfig, PROTOCOL_VERSION};
pub use diffie_hellman::{
    sha3_384, DiffieHellmanState, Group, Pseudonymizer, SharedSecret, DIGEST_SIZE,
};
pub use error::Error;
pub use num_bigint::BigUint;
pub use message::{
    encode_uint, Body, ByteBuffer, ByteSource, BytesReader, Frame, IdGenerator, Message,
    MessageType, PeerInfo, RejectedFrame,
};
pub use status::StatusLog;
pub use sync::{spawn_supervised, Counter, GuardedMap, Promise, Signal};

pub type Result<T> = std::result::Result<T, Error>;

/// A custodian's record: a flat JSON object of attribute values
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Constants shared by every process role
pub mod constants {
    use std::time::Duration;

    /// Header field widths in bytes
    pub const TYPE_FIELDSIZE: usize = 1;
    pub const ID_FIELDSIZE: usize = 8;
    pub const SESSION_ID_FIELDSIZE: usize = 8;
    pub const DATA_SIZE_FIELDSIZE: usize = 3;

    /// Fixed frame header size
    pub const HEADER_SIZE: usize =
        TYPE_FIELDSIZE + ID_FIELDSIZE + SESSION_ID_FIELDSIZE + DATA_SIZE_FIELDSIZE;

    /// Largest payload a frame can carry (2^24 - 1 bytes)
    pub const MAX_PAYLOAD_SIZE: usize = (1 << (8 * DATA_SIZE_FIELDSIZE)) - 1;

    /// Session id meaning "no session"
    pub const NO_SESSION: u64 = 0;

    /// Delay between polls of a non-blocking source
    pub const REFRESH_DELAY: Duration = Duration::from_millis(10);

    /// Default bounded wait for a peer response
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);

    /// Default interval of the connection maintenance pass
    pub const CONNECTION_UPDATE_DELAY: Duration = Duration::from_secs(1);

    /// Default number of ids sampled per analysis query
    pub const ID_SAMPLE_SIZE: usize = 3;

    /// Default minimum qualifying cohort size
    pub const STUDY_GROUP_MINIMAL_SIZE: usize = 4;

    /// Default number of consecutive failed key exchanges that stops the coordinator
    pub const MAX_KEY_EXCHANGE_FAILURES: usize = 3;

    /// Socket read chunk size
    pub const RECV_CHUNK_SIZE: usize = 2048;
}
