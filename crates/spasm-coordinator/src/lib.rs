//! spasm-coordinator: query engine and client loopback
//!
//! The coordinator:
//! 1. Connects to every custodian listed in the network configuration
//! 2. Accepts analysis queries from loopback clients
//! 3. Samples a cohort from its candidate pool, refusing cohorts below
//!    the anonymity floor
//! 4. Runs a ring key exchange over the custodians and checks the proofs
//! 5. Joins the pseudonymized rows by label and returns them
//!
//! ## Usage
//!
//! ```no_run
//! use spasm_coordinator::CoordinatorService;
//! use spasm_core::NetworkConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = NetworkConfig::load("network.json")?;
//!     let service = CoordinatorService::builder(config).build()?;
//!     service.run().await?;
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod loopback;
pub mod metrics;
mod service;

pub use engine::{load_base_data, Analysis, BaseData, FanOut, JoinedRecord, QueryEngine, QueryOutcome, UserQuery};
pub use error::CoordinatorError;
pub use loopback::{LoopbackClient, LoopbackServer};
pub use service::{CoordinatorBuilder, CoordinatorService};
