//! Index database error types

use thiserror::Error;

/// Errors from the index database and the per-folder file sets.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Heed(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("corrupt database entry: {0}")]
    Corrupt(String),

    /// A remote index batch whose sequence numbers go backwards. Protocol
    /// violation by the sending peer.
    #[error("out-of-order sequence for {device}: got {got}, already at {have}")]
    OutOfOrderSequence {
        device: String,
        got: u64,
        have: u64,
    },
}
