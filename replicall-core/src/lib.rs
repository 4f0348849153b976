//! REPLICALL Core - Call Record Model
//!
//! Pure data structures for the RPC-over-replication protocol.
//! This crate contains ONLY data types and their invariants - no I/O,
//! no runtime, no store bindings.

pub mod error;
pub mod identity;
pub mod record;

pub use error::{
    code, CallError, ErrorShape, ProtocolError, ReplicallError, ReplicallResult, StoreError,
};
pub use identity::{new_call_id, CallId, ClientId, DurationMs, Timestamp};
pub use record::{CallRecord, CallState, CallType, RecordFilter, RecordPatch};
