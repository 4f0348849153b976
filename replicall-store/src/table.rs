//! Tabular change-feed binding.
//!
//! In-memory stand-in for a replicated SQL table with a change feed: one
//! shared [`CallTable`] plays the database, each [`TableStore`] handle is
//! a peer connection, and every committed write feeds the change bus.
//! Unlike the merge binding there is a single authoritative row per call,
//! so `update` validates transitions the same way a constrained table
//! would.

use crate::notify::{ChangeBus, ChangeListener};
use crate::CallStore;
use ::async_trait::async_trait;
use replicall_core::{
    CallId, CallRecord, RecordFilter, RecordPatch, ReplicallError, ReplicallResult, StoreError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct TableInner {
    rows: Mutex<HashMap<CallId, CallRecord>>,
    bus: ChangeBus,
}

/// The shared call table.
#[derive(Clone)]
pub struct CallTable {
    inner: Arc<TableInner>,
}

impl CallTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                rows: Mutex::new(HashMap::new()),
                bus: ChangeBus::new(),
            }),
        }
    }

    /// Connect a new peer to the table.
    pub fn connect(&self) -> TableStore {
        TableStore {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of rows ever written. Records are never deleted by the
    /// protocol, so this only grows.
    pub fn row_count(&self) -> usize {
        self.inner.rows.lock().expect("call table poisoned").len()
    }
}

impl Default for CallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's connection to the call table.
pub struct TableStore {
    inner: Arc<TableInner>,
}

#[async_trait]
impl CallStore for TableStore {
    async fn create(&self, record: &CallRecord) -> ReplicallResult<()> {
        {
            let mut rows = self.inner.rows.lock().expect("call table poisoned");
            if rows.contains_key(&record.id) {
                return Err(StoreError::DuplicateId { id: record.id }.into());
            }
            rows.insert(record.id, record.clone());
        }
        self.inner.bus.notify();
        Ok(())
    }

    async fn get(&self, id: CallId) -> ReplicallResult<Option<CallRecord>> {
        let rows = self.inner.rows.lock().expect("call table poisoned");
        Ok(rows.get(&id).cloned())
    }

    async fn query(&self, filter: &RecordFilter) -> ReplicallResult<Vec<CallRecord>> {
        let rows = self.inner.rows.lock().expect("call table poisoned");
        let mut records: Vec<CallRecord> = rows
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn update(&self, id: CallId, patch: RecordPatch) -> ReplicallResult<()> {
        {
            let mut rows = self.inner.rows.lock().expect("call table poisoned");
            let record = rows.get_mut(&id).ok_or(StoreError::NotFound { id })?;
            record
                .apply_patch(&patch)
                .map_err(ReplicallError::Protocol)?;
        }
        self.inner.bus.notify();
        Ok(())
    }

    fn subscribe(&self) -> ChangeListener {
        self.inner.bus.listener()
    }
}

// =============================================================================
// TESTS
// =============================================================================
