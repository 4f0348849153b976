//! The Link: calls in, call records out, results back.

use chrono::Utc;
use dashmap::DashMap;
use replicall_core::{
    CallError, CallId, CallRecord, CallState, CallType, ClientId, ErrorShape, RecordFilter,
    RecordPatch, ReplicallError, StoreError,
};
use replicall_store::{CallStore, ChangeListener};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Waiters = Arc<DashMap<CallId, oneshot::Sender<CallRecord>>>;

/// Caller-side endpoint of the protocol.
///
/// `call` writes a WAITING record and suspends until the record's
/// terminal state replicates back; a drain task owned by the Link
/// completes waiters as change notices arrive. Calls are fully
/// independent: distinct ids, distinct waiters, no head-of-line
/// blocking, out-of-order completion expected.
pub struct Link<S> {
    store: Arc<S>,
    client_id: ClientId,
    waiters: Waiters,
    default_timeout: Option<Duration>,
    drain_task: JoinHandle<()>,
}

impl<S: CallStore + 'static> Link<S> {
    /// Create a Link for one client identity.
    ///
    /// `client_id` is explicit by design; it is the key the drain task
    /// uses to find this peer's completions, and persisting it across
    /// reconnects is what makes caller-supplied `callId` dedup work.
    pub fn new(store: Arc<S>, client_id: ClientId) -> Self {
        let waiters: Waiters = Arc::new(DashMap::new());
        let listener = store.subscribe();
        let drain_task = tokio::spawn(drain(
            Arc::clone(&store),
            client_id,
            Arc::clone(&waiters),
            listener,
        ));
        Self {
            store,
            client_id,
            waiters,
            default_timeout: None,
            drain_task,
        }
    }

    /// Give up on calls after `timeout`. Purely local: the dispatcher
    /// may still execute and commit after the caller stops waiting.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Number of calls currently awaiting completion.
    pub fn in_flight(&self) -> usize {
        self.waiters.len()
    }

    /// Invoke the procedure at `path`, suspending until its record
    /// reaches a terminal state (or the default timeout expires).
    pub async fn call(
        &self,
        path: &str,
        input: Value,
        call_type: CallType,
    ) -> Result<Value, CallError> {
        self.call_with_timeout(path, input, call_type, self.default_timeout)
            .await
    }

    /// Like [`Link::call`] with an explicit (or no) timeout.
    pub async fn call_with_timeout(
        &self,
        path: &str,
        mut input: Value,
        call_type: CallType,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let id = resolve_call_id(&mut input);

        // Register the waiter before writing: the completion may
        // replicate back before `create` even returns.
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);

        let record = CallRecord::new(id, self.client_id, path, input, call_type);
        match self.store.create(&record).await {
            Ok(()) => {}
            Err(ReplicallError::Store(StoreError::DuplicateId { .. })) => {
                // Caller-supplied id already issued (reconnect dedup).
                // Resolve straight away if it already completed.
                debug!(call_id = %id, "call id already issued, waiting on existing record");
                if let Ok(Some(existing)) = self.store.get(id).await {
                    if existing.is_terminal() {
                        self.waiters.remove(&id);
                        return resolve(existing);
                    }
                }
            }
            Err(err) => {
                self.waiters.remove(&id);
                return Err(CallError::Store(err));
            }
        }

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    // Stop waiting locally; the record stays put.
                    self.waiters.remove(&id);
                    return Err(CallError::Timeout {
                        waited_ms: limit.as_millis() as i64,
                    });
                }
            },
            None => rx.await,
        };
        match received {
            Ok(record) => resolve(record),
            Err(_) => Err(CallError::LinkClosed),
        }
    }
}

impl<S> Drop for Link<S> {
    fn drop(&mut self) {
        self.drain_task.abort();
    }
}

/// Use a caller-supplied `callId` (stripped from the input object) or
/// generate a fresh one.
fn resolve_call_id(input: &mut Value) -> CallId {
    if let Some(object) = input.as_object_mut() {
        if let Some(raw) = object.remove("callId") {
            match raw.as_str().and_then(|s| s.parse().ok()) {
                Some(id) => return id,
                None => warn!("ignoring malformed callId in input"),
            }
        }
    }
    CallId::now_v7()
}

/// Map a terminal record onto the caller-facing result.
fn resolve(record: CallRecord) -> Result<Value, CallError> {
    match record.state {
        CallState::Done => Ok(record.response.unwrap_or(Value::Null)),
        CallState::Error => {
            let shape = record
                .error_shape()
                .unwrap_or_else(|| ErrorShape::internal("malformed error response"));
            Err(CallError::Rejected(shape))
        }
        CallState::Waiting => {
            // Drain only forwards terminal records; tolerate anyway.
            Err(CallError::Rejected(ErrorShape::internal(
                "record resolved while WAITING",
            )))
        }
    }
}

/// Completion loop: on every change notice, requery this client's
/// terminal records and complete any matching waiter.
async fn drain<S: CallStore + 'static>(
    store: Arc<S>,
    client_id: ClientId,
    waiters: Waiters,
    mut listener: ChangeListener,
) {
    let filter = RecordFilter::terminal_for(client_id);
    while listener.next().await.is_some() {
        let records = match store.query(&filter).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "drain query failed");
                continue;
            }
        };
        for record in records {
            // Most terminal records here are already-resolved calls from
            // earlier notices; the waiter map makes the rescan idempotent.
            let Some((_, tx)) = waiters.remove(&record.id) else {
                continue;
            };

            // elapsed_ms is best-effort telemetry: fire and forget.
            let elapsed_ms = (Utc::now() - record.created_at).num_milliseconds();
            let telemetry_store = Arc::clone(&store);
            let id = record.id;
            tokio::spawn(async move {
                if let Err(err) = telemetry_store
                    .update(id, RecordPatch::elapsed(elapsed_ms))
                    .await
                {
                    debug!(call_id = %id, error = %err, "elapsed_ms write-back failed");
                }
            });

            let _ = tx.send(record);
        }
    }
    debug!(%client_id, "link drain stopped");
}

// =============================================================================
// TESTS
// =============================================================================
