//! Full-document merge binding.
//!
//! In-memory stand-in for a CRDT-style document store. A [`MergeNetwork`] hands
//! out replicas; each replica applies writes to its own local state and
//! forwards ops to its peers over an async channel, so a write is visible
//! locally at once and on other peers only after propagation. Concurrent
//! updates merge per field, last-writer-wins by Lamport stamp, which is
//! what keeps a dispatcher's terminal patch and a client's `elapsed_ms`
//! patch from clobbering each other.

use crate::notify::{ChangeBus, ChangeListener};
use crate::CallStore;
use ::async_trait::async_trait;
use replicall_core::{
    CallId, CallRecord, RecordFilter, RecordPatch, ReplicallError, ReplicallResult, StoreError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

// ============================================================================
// MERGE MODEL
// ============================================================================

/// Per-field write stamp: Lamport clock, ties broken by replica id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FieldStamp {
    clock: u64,
    replica: u64,
}

/// A call record plus the stamps of its three mutable fields.
#[derive(Debug, Clone)]
struct MergeDoc {
    record: CallRecord,
    state_stamp: FieldStamp,
    response_stamp: FieldStamp,
    elapsed_stamp: FieldStamp,
}

impl MergeDoc {
    fn new(record: CallRecord, stamp: FieldStamp) -> Self {
        Self {
            record,
            state_stamp: stamp,
            response_stamp: stamp,
            elapsed_stamp: stamp,
        }
    }

    /// Merge one stamped patch: each present field wins iff its stamp is
    /// newer than the field's current stamp.
    fn merge(&mut self, patch: &RecordPatch, stamp: FieldStamp) {
        if let Some(state) = patch.state {
            if stamp > self.state_stamp {
                self.record.state = state;
                self.state_stamp = stamp;
            }
        }
        if let Some(response) = &patch.response {
            if stamp > self.response_stamp {
                self.record.response = Some(response.clone());
                self.response_stamp = stamp;
            }
        }
        if let Some(elapsed_ms) = patch.elapsed_ms {
            if stamp > self.elapsed_stamp {
                self.record.elapsed_ms = Some(elapsed_ms);
                self.elapsed_stamp = stamp;
            }
        }
    }
}

/// Op replicated between peers. Channels preserve per-sender order, so a
/// replica's own `Insert` always precedes its patches; patches about a
/// record whose insert came from a third replica may still arrive first
/// and are stashed until it does.
#[derive(Debug, Clone)]
enum ReplicaOp {
    Insert {
        record: CallRecord,
        stamp: FieldStamp,
    },
    Patch {
        id: CallId,
        patch: RecordPatch,
        stamp: FieldStamp,
    },
}

impl ReplicaOp {
    fn stamp(&self) -> FieldStamp {
        match self {
            ReplicaOp::Insert { stamp, .. } | ReplicaOp::Patch { stamp, .. } => *stamp,
        }
    }
}

// ============================================================================
// NETWORK
// ============================================================================

struct Peer {
    replica: u64,
    tx: mpsc::UnboundedSender<ReplicaOp>,
}

struct NetworkInner {
    peers: Mutex<Vec<Peer>>,
    next_replica: AtomicU64,
}

impl NetworkInner {
    /// Forward an op to every peer except its origin.
    fn broadcast(&self, from: u64, op: &ReplicaOp) {
        let peers = self.peers.lock().expect("peer list poisoned");
        for peer in peers.iter().filter(|p| p.replica != from) {
            let _ = peer.tx.send(op.clone());
        }
    }
}

/// A set of mutually replicating [`MergeStore`] peers.
#[derive(Clone)]
pub struct MergeNetwork {
    inner: Arc<NetworkInner>,
}

impl MergeNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                peers: Mutex::new(Vec::new()),
                next_replica: AtomicU64::new(1),
            }),
        }
    }

    /// Join the network as a new replica with empty local state.
    ///
    /// Must be called from within a tokio runtime: each replica spawns a
    /// pump task that applies ops arriving from its peers.
    pub fn replica(&self) -> MergeStore {
        let replica = self.inner.next_replica.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .peers
            .lock()
            .expect("peer list poisoned")
            .push(Peer { replica, tx });

        let shared = Arc::new(ReplicaShared {
            replica,
            clock: AtomicU64::new(0),
            docs: Mutex::new(DocSet::default()),
            bus: ChangeBus::new(),
            network: Arc::clone(&self.inner),
        });
        tokio::spawn(pump(Arc::downgrade(&shared), rx));
        MergeStore { shared }
    }
}

impl Default for MergeNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies incoming ops for one replica until the replica is dropped or
/// all senders are gone.
async fn pump(shared: Weak<ReplicaShared>, mut rx: mpsc::UnboundedReceiver<ReplicaOp>) {
    while let Some(op) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.apply_remote(op);
        shared.bus.notify();
    }
}

// ============================================================================
// REPLICA
// ============================================================================

#[derive(Default)]
struct DocSet {
    docs: HashMap<CallId, MergeDoc>,
    /// Patches that arrived before the record they target.
    pending: HashMap<CallId, Vec<(RecordPatch, FieldStamp)>>,
}

struct ReplicaShared {
    replica: u64,
    clock: AtomicU64,
    docs: Mutex<DocSet>,
    bus: ChangeBus,
    network: Arc<NetworkInner>,
}

impl ReplicaShared {
    fn next_stamp(&self) -> FieldStamp {
        FieldStamp {
            clock: self.clock.fetch_add(1, Ordering::Relaxed) + 1,
            replica: self.replica,
        }
    }

    fn observe(&self, stamp: FieldStamp) {
        self.clock.fetch_max(stamp.clock, Ordering::Relaxed);
    }

    fn apply_remote(&self, op: ReplicaOp) {
        self.observe(op.stamp());
        let mut set = self.docs.lock().expect("doc set poisoned");
        match op {
            ReplicaOp::Insert { record, stamp } => {
                let id = record.id;
                if set.docs.contains_key(&id) {
                    // Duplicate delivery; ids are unique, keep the original.
                    return;
                }
                debug!(replica = self.replica, call_id = %id, "replicated insert");
                let mut doc = MergeDoc::new(record, stamp);
                if let Some(stashed) = set.pending.remove(&id) {
                    for (patch, stamp) in stashed {
                        doc.merge(&patch, stamp);
                    }
                }
                set.docs.insert(id, doc);
            }
            ReplicaOp::Patch { id, patch, stamp } => match set.docs.get_mut(&id) {
                Some(doc) => doc.merge(&patch, stamp),
                None => {
                    debug!(replica = self.replica, call_id = %id, "patch before insert, stashing");
                    set.pending.entry(id).or_default().push((patch, stamp));
                }
            },
        }
    }
}

/// One peer's handle onto the replicated document.
pub struct MergeStore {
    shared: Arc<ReplicaShared>,
}

impl MergeStore {
    /// Replica id, mostly useful in logs.
    pub fn replica(&self) -> u64 {
        self.shared.replica
    }
}

#[async_trait]
impl CallStore for MergeStore {
    async fn create(&self, record: &CallRecord) -> ReplicallResult<()> {
        let stamp = self.shared.next_stamp();
        {
            let mut set = self.shared.docs.lock().expect("doc set poisoned");
            if set.docs.contains_key(&record.id) {
                return Err(StoreError::DuplicateId { id: record.id }.into());
            }
            set.docs
                .insert(record.id, MergeDoc::new(record.clone(), stamp));
        }
        self.shared.bus.notify();
        self.shared.network.broadcast(
            self.shared.replica,
            &ReplicaOp::Insert {
                record: record.clone(),
                stamp,
            },
        );
        Ok(())
    }

    async fn get(&self, id: CallId) -> ReplicallResult<Option<CallRecord>> {
        let set = self.shared.docs.lock().expect("doc set poisoned");
        Ok(set.docs.get(&id).map(|doc| doc.record.clone()))
    }

    async fn query(&self, filter: &RecordFilter) -> ReplicallResult<Vec<CallRecord>> {
        let set = self.shared.docs.lock().expect("doc set poisoned");
        let mut records: Vec<CallRecord> = set
            .docs
            .values()
            .map(|doc| &doc.record)
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn update(&self, id: CallId, patch: RecordPatch) -> ReplicallResult<()> {
        let stamp = self.shared.next_stamp();
        {
            let mut set = self.shared.docs.lock().expect("doc set poisoned");
            let doc = set
                .docs
                .get_mut(&id)
                .ok_or(StoreError::NotFound { id })?;
            // Local writes are validated; merge of replicated ops is not,
            // it must stay total.
            doc.record
                .apply_patch(&patch)
                .map_err(ReplicallError::Protocol)?;
            if patch.state.is_some() {
                doc.state_stamp = stamp;
            }
            if patch.response.is_some() {
                doc.response_stamp = stamp;
            }
            if patch.elapsed_ms.is_some() {
                doc.elapsed_stamp = stamp;
            }
        }
        self.shared.bus.notify();
        self.shared
            .network
            .broadcast(self.shared.replica, &ReplicaOp::Patch { id, patch, stamp });
        Ok(())
    }

    fn subscribe(&self) -> ChangeListener {
        self.shared.bus.listener()
    }
}

// =============================================================================
// TESTS
// =============================================================================
