//! Error types for the Canopy domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Canopy operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Forest / tree errors ---
    #[error("Forest error: {0}")]
    Forest(#[from] ForestError),

    // --- Archive errors ---
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// All LM connections are in use; callers should retry later.
    #[error("LM connection pool exhausted, retry after {retry_after_secs}s")]
    PoolExhausted { retry_after_secs: u64 },

    /// The turn was abandoned by the client before completion.
    #[error("Turn cancelled: {0}")]
    Cancelled(String),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether a retry with backoff is worth attempting.
    ///
    /// Auth failures and unknown models are permanent; everything that looks
    /// like a transport hiccup is transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout(_)
                | Self::Network(_)
                | Self::StreamInterrupted(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ForestError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Parent node not found: {0}")]
    ParentNotFound(String),

    #[error("No active node selected")]
    NoActiveNode,

    #[error("Empty message text")]
    EmptyMessage,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding model mismatch: collection holds '{stored}', got '{requested}'")]
    CollectionMismatch { stored: String, requested: String },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}
