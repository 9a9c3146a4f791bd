//! Coordinator error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Fan-out of {0} did not complete")]
    IncompleteFanOut(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Base data error: {0}")]
    BaseData(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error(transparent)]
    Core(#[from] spasm_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// Whether the error ends only the current query
    pub fn is_query_scoped(&self) -> bool {
        match self {
            CoordinatorError::IncompleteFanOut(_) | CoordinatorError::QueryFailed(_) => true,
            CoordinatorError::Core(e) => e.is_session_scoped(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
