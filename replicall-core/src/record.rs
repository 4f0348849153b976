//! Call record: the replicated unit representing one RPC invocation
//! and its eventual result.

use crate::error::{ErrorShape, ProtocolError};
use crate::identity::{CallId, ClientId, DurationMs, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// ENUMS
// ============================================================================

/// Kind of procedure being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Query,
    Mutation,
    Subscription,
}

/// Lifecycle state of a call record.
///
/// One tagged enum instead of the ad hoc `done`/`error` boolean pairs:
/// transitions only go `Waiting -> {Done, Error}` and never reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    /// Created by a Link, not yet executed.
    Waiting,
    /// Executed successfully; `response` holds the procedure's return value.
    Done,
    /// Execution failed; `response` holds `{"error": <ErrorShape>}`.
    Error,
}

impl CallState {
    /// Terminal states receive no further dispatcher mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Done | CallState::Error)
    }
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// One RPC invocation, replicated to every peer.
///
/// `path`, `input`, `call_type`, `created_at` and `client_id` are immutable
/// after creation; only `state`, `response` and `elapsed_ms` mutate, and
/// only through [`RecordPatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Unique correlation key; caller-assigned or generated.
    pub id: CallId,
    /// Procedure name, e.g. `"user.create"`.
    pub path: String,
    /// Serialized input payload.
    pub input: Value,
    /// Kind of procedure invoked.
    pub call_type: CallType,
    /// Lifecycle state.
    pub state: CallState,
    /// Creation time on the originating peer.
    pub created_at: Timestamp,
    /// Identity of the originating Link.
    pub client_id: ClientId,
    /// Result payload; `Some` iff the record is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Client-computed round-trip time; best-effort telemetry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<DurationMs>,
}

impl CallRecord {
    /// Create a new Waiting record, stamped with the current time.
    pub fn new(
        id: CallId,
        client_id: ClientId,
        path: impl Into<String>,
        input: Value,
        call_type: CallType,
    ) -> Self {
        Self {
            id,
            path: path.into(),
            input,
            call_type,
            state: CallState::Waiting,
            created_at: Utc::now(),
            client_id,
            response: None,
            elapsed_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Parse the error shape out of an `Error` record's response.
    /// `None` for non-error records and malformed responses.
    pub fn error_shape(&self) -> Option<ErrorShape> {
        if self.state != CallState::Error {
            return None;
        }
        self.response
            .as_ref()
            .and_then(|r| r.get("error"))
            .and_then(|e| serde_json::from_value(e.clone()).ok())
    }

    /// Validate and apply a patch in place.
    ///
    /// Enforces the transition invariants: a terminal record accepts only
    /// `elapsed_ms`, and `state` never leaves a terminal state or re-enters
    /// `Waiting`.
    pub fn apply_patch(&mut self, patch: &RecordPatch) -> Result<(), ProtocolError> {
        if let Some(to) = patch.state {
            if self.state.is_terminal() || to == CallState::Waiting {
                return Err(ProtocolError::StateReversal {
                    id: self.id,
                    from: self.state,
                    to,
                });
            }
        }
        if patch.response.is_some() && self.state.is_terminal() {
            return Err(ProtocolError::TerminalOverwrite {
                id: self.id,
                field: "response",
            });
        }

        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(response) = &patch.response {
            self.response = Some(response.clone());
        }
        if let Some(elapsed_ms) = patch.elapsed_ms {
            self.elapsed_ms = Some(elapsed_ms);
        }
        Ok(())
    }
}

// ============================================================================
// PATCH & FILTER
// ============================================================================

/// Partial update to a call record. Immutable fields (`path`, `input`,
/// `call_type`, `created_at`, `client_id`) are not representable here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    /// New lifecycle state.
    pub state: Option<CallState>,
    /// Result payload.
    pub response: Option<Value>,
    /// Client-computed round-trip time.
    pub elapsed_ms: Option<DurationMs>,
}

impl RecordPatch {
    /// Terminal success: `state = Done` plus the procedure's return value.
    pub fn done(response: Value) -> Self {
        Self {
            state: Some(CallState::Done),
            response: Some(response),
            elapsed_ms: None,
        }
    }

    /// Terminal failure: `state = Error` plus the wrapped error shape.
    pub fn error(shape: &ErrorShape) -> Self {
        Self {
            state: Some(CallState::Error),
            response: Some(json!({ "error": shape })),
            elapsed_ms: None,
        }
    }

    /// Response-only patch (written before the terminal flip by stores
    /// that cannot batch the two).
    pub fn response(response: Value) -> Self {
        Self {
            state: None,
            response: Some(response),
            elapsed_ms: None,
        }
    }

    /// Telemetry-only patch.
    pub fn elapsed(elapsed_ms: DurationMs) -> Self {
        Self {
            state: None,
            response: None,
            elapsed_ms: Some(elapsed_ms),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.response.is_none() && self.elapsed_ms.is_none()
    }
}

/// Predicate for store queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    /// Exact state match.
    pub state: Option<CallState>,
    /// Match only terminal (`true`) or only non-terminal (`false`) records.
    pub terminal: Option<bool>,
    /// Match records created by this client.
    pub client_id: Option<ClientId>,
}

impl RecordFilter {
    /// All Waiting records (the dispatcher's scan filter).
    pub fn waiting() -> Self {
        Self {
            state: Some(CallState::Waiting),
            ..Self::default()
        }
    }

    /// Terminal records for one client (the Link's drain filter).
    pub fn terminal_for(client_id: ClientId) -> Self {
        Self {
            terminal: Some(true),
            client_id: Some(client_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &CallRecord) -> bool {
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        if let Some(terminal) = self.terminal {
            if record.is_terminal() != terminal {
                return false;
            }
        }
        if let Some(client_id) = self.client_id {
            if record.client_id != client_id {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// TESTS
// =============================================================================
