//! Error types for replyq.
//!
//! A caller-side timeout is not an error: it is reported as
//! [`ReplyOutcome::TimedOut`](crate::model::ReplyOutcome::TimedOut).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The broker could not be reached at startup.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// Opening or using a consumption/publication handle failed.
    #[error("channel error: {0}")]
    Channel(String),

    /// Publishing a request failed.
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// A reply arrived carrying someone else's correlation id.
    #[error("correlation mismatch: expected {expected}, got {}", actual.as_deref().unwrap_or("<none>"))]
    CorrelationMismatch {
        expected: String,
        actual: Option<String>,
    },

    #[error("reply stream closed before a reply arrived")]
    ReplyStreamClosed,

    #[error("shutting down, not accepting new requests")]
    ShuttingDown,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
