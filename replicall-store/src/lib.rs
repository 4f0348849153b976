//! REPLICALL Store - Call Record Store Adapter
//!
//! Defines the store abstraction the protocol runs over, plus two
//! in-memory bindings standing in for the external replication engines:
//! a full-document merge store with asynchronous replica propagation
//! ([`MergeNetwork`]) and a tabular change-feed store ([`CallTable`]).
//! Both satisfy the same [`CallStore`] contract.

pub mod merge;
pub mod notify;
pub mod table;

pub use merge::{MergeNetwork, MergeStore};
pub use notify::{ChangeListener, ChangeNotice};
pub use table::{CallTable, TableStore};

use ::async_trait::async_trait;
use replicall_core::{CallId, CallRecord, RecordFilter, RecordPatch, ReplicallResult};

/// Store adapter consumed by the Link and the Dispatcher.
///
/// Reads reflect the most recent *locally applied* replication; a write
/// returns once locally durable, with no cross-peer acknowledgement.
/// Neither side may assume its own write is synchronously visible on
/// other peers.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Durably insert a new record. Fails on a duplicate id.
    async fn create(&self, record: &CallRecord) -> ReplicallResult<()>;

    /// Get a record by id, as locally replicated.
    async fn get(&self, id: CallId) -> ReplicallResult<Option<CallRecord>>;

    /// All locally replicated records matching the filter.
    async fn query(&self, filter: &RecordFilter) -> ReplicallResult<Vec<CallRecord>>;

    /// Merge a partial update into a record. Concurrent updates to
    /// disjoint fields must not corrupt the record.
    async fn update(&self, id: CallId, patch: RecordPatch) -> ReplicallResult<()>;

    /// Change notifications: at least one notice after any write that
    /// could affect query results; spurious and coalesced notices are
    /// allowed, and only local/causal ordering is guaranteed.
    fn subscribe(&self) -> ChangeListener;
}
