//! Error types for REPLICALL operations

use crate::identity::{CallId, DurationMs};
use crate::record::CallState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// ERROR SHAPE (crosses the replication boundary)
// ============================================================================

/// Canonical machine-readable error codes, mirroring the RPC framework's
/// vocabulary. `ErrorShape::code` is an open string; these are the values
/// the protocol itself produces.
pub mod code {
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const METHOD_NOT_SUPPORTED: &str = "METHOD_NOT_SUPPORTED";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
}

/// Serializable procedure error. The dispatcher writes this into the
/// record's response as `{"error": shape}`; the Link reconstructs the
/// caller-facing rejection from it.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ErrorShape {
    /// Machine-readable code, e.g. `"CONFLICT"`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(code::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(code::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(code::CONFLICT, message)
    }

    pub fn method_not_supported(message: impl Into<String>) -> Self {
        Self::new(code::METHOD_NOT_SUPPORTED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(code::INTERNAL_SERVER_ERROR, message)
    }
}

// ============================================================================
// PROCESS-LOCAL ERRORS
// ============================================================================

/// Store adapter errors: transport and availability failures. These never
/// become a terminal record state; the affected attempt is retried by a
/// later scan.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Call record not found: {id}")]
    NotFound { id: CallId },

    #[error("Duplicate call id: {id}")]
    DuplicateId { id: CallId },

    #[error("Write failed for call {id}: {reason}")]
    WriteFailed { id: CallId, reason: String },

    #[error("Store disconnected: {reason}")]
    Disconnected { reason: String },
}

/// Protocol violations: records or patches that break the call-record
/// invariants. Skipped or rejected, never fatal to either side's loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid transition for call {id}: {from:?} -> {to:?}")]
    StateReversal {
        id: CallId,
        from: CallState,
        to: CallState,
    },

    #[error("Field `{field}` of call {id} is immutable once terminal")]
    TerminalOverwrite { id: CallId, field: &'static str },

    #[error("Malformed call record {id}: {reason}")]
    MalformedRecord { id: CallId, reason: String },
}

/// Master error type for REPLICALL operations.
#[derive(Debug, Clone, Error)]
pub enum ReplicallError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type alias for REPLICALL operations.
pub type ReplicallResult<T> = Result<T, ReplicallError>;

// ============================================================================
// CALLER-FACING ERRORS
// ============================================================================

/// What a `Link::call` can fail with.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The procedure committed an Error record; the shape round-tripped
    /// through the store.
    #[error("Call rejected: {0}")]
    Rejected(ErrorShape),

    /// The caller-side timeout expired. Purely local: the dispatcher may
    /// still execute and commit afterwards.
    #[error("Call timed out after {waited_ms}ms")]
    Timeout { waited_ms: DurationMs },

    /// The Link shut down while the call was in flight.
    #[error("Link closed while waiting for response")]
    LinkClosed,

    /// The local record write failed; the call was never issued.
    #[error("Call not issued: {0}")]
    Store(#[from] ReplicallError),
}

impl CallError {
    /// The round-tripped error shape, when there is one.
    pub fn shape(&self) -> Option<&ErrorShape> {
        match self {
            CallError::Rejected(shape) => Some(shape),
            _ => None,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_shape_serializes_without_empty_data() {
        let shape = ErrorShape::conflict("taken");
        let value = serde_json::to_value(&shape).unwrap();
        assert_eq!(value, json!({ "code": "CONFLICT", "message": "taken" }));
    }

    #[test]
    fn test_error_shape_round_trips_data() {
        let shape = ErrorShape::bad_request("invalid input").with_data(json!({ "field": "name" }));
        let back: ErrorShape = serde_json::from_value(serde_json::to_value(&shape).unwrap()).unwrap();
        assert_eq!(shape, back);
    }

    #[test]
    fn test_store_error_display() {
        let id = CallId::now_v7();
        let err = StoreError::DuplicateId { id };
        let msg = format!("{}", err);
        assert!(msg.contains("Duplicate call id"));
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn test_protocol_error_display_state_reversal() {
        let err = ProtocolError::StateReversal {
            id: CallId::now_v7(),
            from: CallState::Done,
            to: CallState::Waiting,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid transition"));
        assert!(msg.contains("Done"));
        assert!(msg.contains("Waiting"));
    }

    #[test]
    fn test_replicall_error_from_variants() {
        let store = ReplicallError::from(StoreError::Disconnected {
            reason: "closed".to_string(),
        });
        assert!(matches!(store, ReplicallError::Store(_)));

        let protocol = ReplicallError::from(ProtocolError::MalformedRecord {
            id: CallId::now_v7(),
            reason: "response on WAITING".to_string(),
        });
        assert!(matches!(protocol, ReplicallError::Protocol(_)));
    }

    #[test]
    fn test_call_error_shape_accessor() {
        let rejected = CallError::Rejected(ErrorShape::conflict("taken"));
        assert_eq!(rejected.shape().unwrap().code, code::CONFLICT);
        assert!(CallError::Timeout { waited_ms: 10 }.shape().is_none());
    }
}
