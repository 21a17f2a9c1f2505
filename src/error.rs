use thiserror::Error;

/// A raw vector could not be turned into an index-ready embedding.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// Length after flattening one level differs from the index dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// A component is NaN or infinite.
    #[error("non-finite component at position {position}")]
    NonFinite { position: usize },
    /// Every component is zero; cosine similarity is undefined.
    #[error("zero-norm vector")]
    ZeroNorm,
    /// Textual vector that does not parse as a JSON array of numbers.
    #[error("unparseable vector: {0}")]
    Unparseable(String),
}

/// Failures reported by a backing store gateway.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("store request failed: {0}")]
    Request(String),
    /// The store answered with a non-success status.
    #[error("store returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// The response body did not match the expected row shape.
    #[error("malformed store response: {0}")]
    Decode(String),
    /// The store is known to be unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by index construction and registry orchestration.
#[derive(Debug, Error, Clone)]
pub enum IndexError {
    /// One item of a rebuild snapshot failed validation; the rebuild was aborted.
    #[error("invalid vector for item {item_id}: {source}")]
    InvalidVector {
        item_id: String,
        #[source]
        source: ValidationError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("graph construction failed: {0}")]
    Build(String),
}

impl IndexError {
    /// True when the failure came from the backing store rather than the data.
    pub fn is_store(&self) -> bool {
        matches!(self, IndexError::Store(_))
    }
}
