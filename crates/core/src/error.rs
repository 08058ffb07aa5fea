//! Error types for the Parley domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each failure class of a turn has its own error type, because each one is
//! handled differently: model errors end the turn, operation errors are fed
//! back to the model, retrieval errors degrade the context, and channel
//! errors stop the turn quietly.

use thiserror::Error;

/// The top-level error type for all Parley operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model service errors ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    // --- Operation errors ---
    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    // --- Retrieval errors ---
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    // --- Outbound channel errors ---
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

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

/// A failure of the model round-trip. Always fatal for the turn.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by model service, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Model service not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// A failure of a single operation. Isolated to that operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationError {
    #[error("Unsupported operation: {kind}")]
    Unsupported { kind: String },

    #[error("Invalid parameters for {kind}: {reason}")]
    InvalidParameters { kind: String, reason: String },

    #[error("{kind} failed: {reason}")]
    ExecutionFailed { kind: String, reason: String },

    #[error("{kind} timed out after {timeout_ms}ms")]
    Timeout { kind: String, timeout_ms: u64 },
}

impl OperationError {
    /// Short machine-readable code, used in stream payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unsupported { .. } => "unsupported_operation",
            Self::InvalidParameters { .. } => "invalid_parameters",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// A failure inside the retrieval pipeline. Never surfaces to the caller;
/// the pipeline degrades instead.
#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Vector search failed: {0}")]
    VectorSearchFailed(String),

    #[error("Lexical search failed: {0}")]
    LexicalSearchFailed(String),

    #[error("Ingestion failed: {0}")]
    Ingestion(String),
}

/// The outbound event channel can no longer be written to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Outbound channel closed by the client")]
    Closed,

    #[error("Stream already terminated")]
    Terminated,
}
