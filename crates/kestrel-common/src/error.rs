//! Error types for Kestrel.

use thiserror::Error;

/// Result type alias using KestrelError.
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Errors that can occur in Kestrel operations.
#[derive(Debug, Error)]
pub enum KestrelError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Buffer cache errors
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Buffer pool unusable after a failed flush")]
    PoolPoisoned,

    #[error("Page offset {offset} is not a multiple of the page size {page_size}")]
    UnalignedPage { offset: u64, page_size: usize },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: u64, reason: String },

    #[error("Page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    // Index errors
    #[error("Key not found: {key:02x?}")]
    KeyNotFound { key: Vec<u8> },

    #[error("Duplicate key in unique index: {key:02x?}")]
    DuplicateKey { key: Vec<u8> },

    #[error("Index modified during iteration (stamp {expected}, now {actual})")]
    ConcurrentModification { expected: u64, actual: u64 },

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Key encoding error: {0}")]
    KeyEncoding(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KestrelError {
    /// Returns true for errors after which the pool or index must not be reused.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KestrelError::InvariantViolation(_)
                | KestrelError::PoolPoisoned
                | KestrelError::PageCorrupted { .. }
                | KestrelError::Internal(_)
        )
    }
}
