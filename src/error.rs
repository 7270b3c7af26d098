//! Error types for the cascade library.

use thiserror::Error;

/// Main error type for cascade operations.
///
/// Every variant is a request-rejection outcome reported to the immediate
/// caller; nothing here is process-fatal.
#[derive(Error, Debug)]
pub enum CascadeError {
    /// The request exceeds the bucket's capacity and can never be satisfied
    /// without reconfiguration.
    #[error("requested {requested} tokens but bucket capacity is {capacity}")]
    NotEnoughSize { requested: f64, capacity: f64 },

    /// An unbounded token request, rejected independent of capacity.
    #[error("cannot remove an infinite number of tokens")]
    NoInfinityRemoval,

    /// The combined wait across the hierarchy exceeds the tightest
    /// configured ceiling.
    #[error("required wait of {required_ms}ms exceeds maximum wait of {max_ms}ms")]
    ExceedsMaxWait { required_ms: u64, max_ms: u64 },

    /// Persistence was invoked on a bucket without a persistence key.
    #[error("bucket has no persistence key configured")]
    NoPersistenceConfigured,

    /// Underlying state store errors, surfaced verbatim.
    #[error("state store error: {0}")]
    Store(#[from] anyhow::Error),

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for cascade operations.
pub type Result<T> = std::result::Result<T, CascadeError>;
