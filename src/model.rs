//! Core data model.
//!
//! A request travels as a JSON [`Payload`] plus broker-level metadata
//! (correlation id, reply address, content type). The worker answers with a
//! [`ReplyEnvelope`] carrying the same correlation id.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub const CONTENT_TYPE_JSON: &str = "application/json";

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// Opaque token linking a request to its reply.
///
/// Freshly generated tokens are random 128-bit UUIDs; tokens read off the
/// wire are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Request body: `{ "message": string }`.
///
/// A missing `message` field decodes to an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub message: String,
}

impl Payload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Broker-level message metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

/// A request as published by the caller. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub payload: Payload,
    pub correlation_id: CorrelationId,
    pub reply_to: String,
    pub content_type: String,
}

impl RequestEnvelope {
    pub fn new(
        payload: Payload,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            payload,
            correlation_id,
            reply_to: reply_to.into(),
            content_type: CONTENT_TYPE_JSON.to_string(),
        }
    }

    pub fn body(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.payload)
    }

    pub fn properties(&self) -> MessageProperties {
        MessageProperties {
            correlation_id: Some(self.correlation_id.0.clone()),
            reply_to: Some(self.reply_to.clone()),
            content_type: Some(self.content_type.clone()),
        }
    }
}

/// A worker's answer to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    /// Identifier of the replying worker.
    pub source: String,
    pub correlation_id: CorrelationId,
    /// Human-readable processing time, e.g. `"212.5ms"`.
    pub duration: String,
    pub payload: Payload,
}

impl ReplyEnvelope {
    pub fn new(
        source: impl Into<String>,
        correlation_id: CorrelationId,
        elapsed: Duration,
        payload: Payload,
    ) -> Self {
        Self {
            source: source.into(),
            correlation_id,
            duration: format!("{elapsed:?}"),
            payload,
        }
    }
}

/// How a caller's wait resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Replied(ReplyEnvelope),
    /// The deadline fired first. The request is neither retried nor
    /// cancelled at the broker; a late reply is dropped.
    TimedOut {
        correlation_id: CorrelationId,
        waited: Duration,
    },
}

impl ReplyOutcome {
    pub fn reply(&self) -> Option<&ReplyEnvelope> {
        match self {
            Self::Replied(reply) => Some(reply),
            Self::TimedOut { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

/// Per-worker lifecycle. Cancellation is only observed while `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Between messages; the only point where cancellation is checked.
    Idle,
    /// Waiting on the next delivery.
    Consuming,
    Processing,
    Replying,
    Acking,
    /// Terminal.
    Stopped,
}

impl WorkerState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Idle, Consuming)
                | (Idle, Stopped)
                | (Consuming, Processing)
                | (Consuming, Idle)      // cancelled while waiting
                | (Consuming, Stopped)   // delivery stream closed
                | (Processing, Replying)
                | (Processing, Acking)   // no reply address
                | (Replying, Acking)
                | (Acking, Idle)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Consuming => "consuming",
            Self::Processing => "processing",
            Self::Replying => "replying",
            Self::Acking => "acking",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
