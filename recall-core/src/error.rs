//! Error types for the Recall system.

/// Result type alias for Recall operations.
pub type Result<T> = std::result::Result<T, RecallError>;

/// Main error type for the Recall system.
#[derive(Debug, thiserror::Error)]
pub enum RecallError {
    /// Unknown memory id, unknown backup, missing snapshot file
    #[error("Not found: {resource} {id}")]
    NotFound { resource: String, id: String },

    /// Malformed input: bad backup names, invalid prefixes, dimension changes
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// State does not permit the operation (integrity mismatch, missing confirm)
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Bounded queue overflow; carries the suggested client backoff
    #[error("Resource exhausted: {message}")]
    ResourceExhausted { message: String, retry_after_sec: u64 },

    /// Vector store RPC failures
    #[error("Vector store error: {0}")]
    VectorStore(String),

    /// Embedding runtime failures
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Object storage failures
    #[error("Cloud sync error: {0}")]
    Cloud(String),

    /// LLM provider failures
    #[error("Provider error: {0}")]
    Provider(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

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

impl RecallError {
    /// Create a new not found error
    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    /// Create a new invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new failed precondition error
    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    /// Create a new queue-full error with a suggested retry delay
    pub fn resource_exhausted(msg: impl Into<String>, retry_after_sec: u64) -> Self {
        Self::ResourceExhausted {
            message: msg.into(),
            retry_after_sec,
        }
    }

    /// Create a new vector store error
    pub fn vector_store(msg: impl Into<String>) -> Self {
        Self::VectorStore(msg.into())
    }

    /// Create a new embedding error
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Create a new cloud sync error
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud(msg.into())
    }

    /// Create a new provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error maps to an unavailable dependency
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::VectorStore(_) | Self::Cloud(_) | Self::Provider(_)
        )
    }
}
