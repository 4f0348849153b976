//! REPLICALL Client - Caller Side
//!
//! The Link turns a call into a call-record write and a later observed
//! state transition into a resolved or rejected result. It never talks
//! to the dispatcher directly; the replicated store is the only channel.

pub mod link;

pub use link::Link;
pub use replicall_core::CallError;
