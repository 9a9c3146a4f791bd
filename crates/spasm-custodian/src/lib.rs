//! spasm-custodian: data server process
//!
//! Holds a private partition of records, takes part in the per-session
//! ring key exchange and answers DATA_REQUEST with records whose ids are
//! replaced by salted SHA3-384 labels.

pub mod data;
pub mod error;
pub mod server;
pub mod store;

pub use data::{DataComponent, LabelledRows};
pub use error::CustodianError;
pub use server::{CustodianBuilder, CustodianHandler, CustodianServer};
pub use store::{MemoryStore, RecordStore};
