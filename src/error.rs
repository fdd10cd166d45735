use crate::application::coordinator::HazardReport;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Step failure: {0}")]
    StepFailure(String),
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),
    #[error("Heuristic hazard: {0}")]
    HeuristicHazard(HazardReport),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Internal error: {0}")]
    InternalError(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RouteError {
    /// Transient store or channel conditions that the coordinator may retry.
    pub fn is_resource_unavailable(&self) -> bool {
        matches!(self, RouteError::ResourceUnavailable(_))
    }

    pub fn is_heuristic_hazard(&self) -> bool {
        matches!(self, RouteError::HeuristicHazard(_))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for RouteError {
    fn from(err: rocksdb::Error) -> Self {
        RouteError::InternalError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, RouteError>;
