use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicatorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log corruption: {0}")]
    Corruption(String),

    #[error("Replicator closed")]
    Closed,

    #[error("Replica is not primary")]
    NotPrimary,

    #[error("Reconfiguration pending")]
    ReconfigurationPending,

    #[error("Replication queue full")]
    QueueFull,

    #[error("No write quorum")]
    NoWriteQuorum,

    #[error("Operation too large: {0} bytes")]
    OperationTooLarge(u64),

    #[error("Transaction aborted")]
    TransactionAborted,

    #[error("Backup in progress")]
    BackupInProgress,

    #[error("Incremental backup requested without a prior full backup")]
    MissingFullBackup,

    #[error("Writes throttled: log usage above threshold")]
    Throttled,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Out of capacity: {0}")]
    OutOfCapacity(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicatorError {
    /// Errors the transport is allowed to return from a replicate call.
    /// Anything else is treated as a fault on the role context.
    pub fn is_expected_replication_error(&self) -> bool {
        matches!(
            self,
            ReplicatorError::NotPrimary
                | ReplicatorError::ReconfigurationPending
                | ReplicatorError::QueueFull
                | ReplicatorError::NoWriteQuorum
                | ReplicatorError::Closed
                | ReplicatorError::OperationTooLarge(_)
                | ReplicatorError::Cancelled
        )
    }
}

impl Clone for ReplicatorError {
    fn clone(&self) -> Self {
        match self {
            ReplicatorError::Io(e) => ReplicatorError::IoError(e.to_string()),
            ReplicatorError::Corruption(s) => ReplicatorError::Corruption(s.clone()),
            ReplicatorError::Closed => ReplicatorError::Closed,
            ReplicatorError::NotPrimary => ReplicatorError::NotPrimary,
            ReplicatorError::ReconfigurationPending => ReplicatorError::ReconfigurationPending,
            ReplicatorError::QueueFull => ReplicatorError::QueueFull,
            ReplicatorError::NoWriteQuorum => ReplicatorError::NoWriteQuorum,
            ReplicatorError::OperationTooLarge(n) => ReplicatorError::OperationTooLarge(*n),
            ReplicatorError::TransactionAborted => ReplicatorError::TransactionAborted,
            ReplicatorError::BackupInProgress => ReplicatorError::BackupInProgress,
            ReplicatorError::MissingFullBackup => ReplicatorError::MissingFullBackup,
            ReplicatorError::Throttled => ReplicatorError::Throttled,
            ReplicatorError::InvalidOperation(s) => ReplicatorError::InvalidOperation(s.clone()),
            ReplicatorError::InvalidParameter(s) => ReplicatorError::InvalidParameter(s.clone()),
            ReplicatorError::Cancelled => ReplicatorError::Cancelled,
            ReplicatorError::Timeout(s) => ReplicatorError::Timeout(s.clone()),
            ReplicatorError::OutOfCapacity(s) => ReplicatorError::OutOfCapacity(s.clone()),
            ReplicatorError::Serialization(s) => ReplicatorError::Serialization(s.clone()),
            ReplicatorError::IoError(s) => ReplicatorError::IoError(s.clone()),
            ReplicatorError::Internal(s) => ReplicatorError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicatorError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for ReplicatorError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ReplicatorError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ReplicatorError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ReplicatorError::Serialization(e.to_string())
    }
}
