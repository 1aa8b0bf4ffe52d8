use thiserror::Error;

/// Error taxonomy shared by all engine operations.
///
/// Preflight conditions (`PermissionDenied`, `Conflict`, `NotFound`,
/// `InvalidName`) are raised before any destructive statement runs.
/// Mid-sequence failures are never rolled back; they surface as
/// `Inconsistent` or as a partial report so the caller can decide whether
/// to retry, delete or inspect manually.
#[derive(Debug, Error)]
pub enum Error {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("{operation}: {failed} of {total} items failed")]
    PartialFailure {
        operation: String,
        failed: usize,
        total: usize,
    },
    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },
    #[error("inconsistent state: {0}")]
    Inconsistent(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("unparseable datasource: {0}")]
    Datasource(String),
    #[error("project document error: {0}")]
    Project(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
