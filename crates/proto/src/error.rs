//! Protocol error types

use thiserror::Error;

/// Fatal connection-level failures. Any of these closes the connection;
/// the model reconciles on the next reconnect.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the limit")]
    Oversized(usize),

    #[error("truncated frame while reading {0}")]
    Truncated(&'static str),

    #[error("unknown message type {0:#04x}")]
    UnknownMessage(u8),

    #[error("malformed {context}: {detail}")]
    Malformed {
        context: &'static str,
        detail: String,
    },

    #[error("first message was not Hello")]
    MissingHello,

    #[error("peer violated the protocol: {0}")]
    Violation(String),

    #[error("connection closed")]
    Closed,
}

/// Failures of a single block request; the connection survives these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The connection went away; the request was canceled.
    #[error("request canceled: connection closed")]
    Canceled,

    #[error("peer has no such file")]
    NoSuchFile,

    #[error("peer considers the file invalid")]
    InvalidFile,

    #[error("peer reported a generic error")]
    Generic,
}
