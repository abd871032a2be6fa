//! Error types for the Engram system.

/// Result type alias for Engram operations.
pub type Result<T> = std::result::Result<T, EngramError>;

/// Main error type for the Engram system.
#[derive(Debug, thiserror::Error)]
pub enum EngramError {
    /// Entity, blob or commit does not exist
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Vector dimension contradicts the first-seen dimension
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Blob content hash disagrees with its key
    #[error("Integrity check failed for {key}: content hashed to {actual}")]
    IntegrityCheckFailed { key: String, actual: String },

    /// Operation aborted by a cancellation token
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Storage backend returned a retryable rate-limit signal
    #[error("Throttled by storage backend: {0}")]
    Throttled(String),

    /// Transient I/O failure; retryable
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Explicit-id insert for an id already present under strict policy
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// `deny` cascade policy hit incident edges on noun delete
    #[error("Cannot delete {id}: {verb_count} incident verb(s) require cascade")]
    CascadeRequired { id: String, verb_count: usize },

    /// Storage layer errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index errors
    #[error("Index error: {0}")]
    Index(String),

    /// Embedding provider errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngramError {
    /// Create a new not found error
    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    /// Create a new dimension mismatch error
    pub fn dimension_mismatch(expected: usize, got: usize) -> Self {
        Self::DimensionMismatch { expected, got }
    }

    /// Create a new cancelled error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a new throttled error
    pub fn throttled(msg: impl Into<String>) -> Self {
        Self::Throttled(msg.into())
    }

    /// Create a new storage-unavailable error
    pub fn storage_unavailable(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new index error
    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// Create a new embedding error
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::StorageUnavailable(_))
    }

    /// Check if this is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
