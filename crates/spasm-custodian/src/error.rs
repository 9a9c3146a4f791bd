//! Custodian error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CustodianError {
    #[error("Data server `{0}` is not in the network configuration")]
    UnknownDataServer(String),

    #[error("Record store error: {0}")]
    Store(String),

    #[error(transparent)]
    Core(#[from] spasm_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CustodianError>;
