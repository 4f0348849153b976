//! Level-triggered dispatcher: scans for WAITING records and commits
//! terminal states.

use crate::context::ProcedureContext;
use crate::router::Router;
use replicall_core::{CallId, CallType, ClientId, RecordFilter, RecordPatch};
use replicall_core::{CallRecord, ErrorShape};
use replicall_store::{CallStore, ChangeListener};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default bound on the idempotency gate.
const DEFAULT_SEEN_CAPACITY: usize = 4096;

// ============================================================================
// IDEMPOTENCY GATE
// ============================================================================

/// Bounded set of already-claimed call ids with FIFO eviction.
///
/// A soft per-process guard, not a durable dedup ledger: it only needs to
/// cover the window between claiming a record and the record's own
/// terminal state replicating back, so redundant scans in that window
/// don't double-execute. Empty after restart, which is what makes
/// execution at-least-once across processes and exactly-once within one.
pub struct SeenIds {
    set: HashSet<CallId>,
    order: VecDeque<CallId>,
    capacity: usize,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the id was already present. Evicts the oldest
    /// entries once over capacity.
    pub fn insert(&mut self, id: CallId) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    /// Un-claim an id so a later scan retries it.
    pub fn remove(&mut self, id: &CallId) {
        if self.set.remove(id) {
            self.order.retain(|seen| seen != id);
        }
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// What the observability callback sees on a failed execution. Purely
/// informational; committed state is already decided when it runs.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub error: ErrorShape,
    pub path: String,
    pub call_type: CallType,
    pub input: Value,
    pub client_id: ClientId,
}

type ErrorCallback = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

/// Server-side executor for WAITING call records.
///
/// Level-triggered by design: it rescans all visible WAITING records on
/// startup and on every change notice, because edge notifications may be
/// missed or coalesced. Each claimed record executes on its own task, so
/// a slow procedure never holds up the records behind it. There is no
/// cross-process claim/lease step; two dispatcher replicas watching the
/// same store can double-execute a record, so run one dispatcher per
/// store.
pub struct Dispatcher<S, C> {
    store: Arc<S>,
    router: Arc<Router<C>>,
    app: Arc<C>,
    seen: Arc<Mutex<SeenIds>>,
    on_error: Option<ErrorCallback>,
}

impl<S, C> Dispatcher<S, C>
where
    S: CallStore + 'static,
    C: Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, router: Router<C>, app: C) -> Self {
        Self {
            store,
            router: Arc::new(router),
            app: Arc::new(app),
            seen: Arc::new(Mutex::new(SeenIds::new(DEFAULT_SEEN_CAPACITY))),
            on_error: None,
        }
    }

    /// Bound the idempotency gate (default 4096 ids).
    pub fn with_seen_capacity(mut self, capacity: usize) -> Self {
        self.seen = Arc::new(Mutex::new(SeenIds::new(capacity)));
        self
    }

    /// Observability callback invoked after a failed execution commits.
    /// Must not (and cannot) alter the committed state.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Subscribe, then run the scan loop on the runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let listener = self.store.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(listener, shutdown_rx));
        DispatcherHandle { shutdown_tx, task }
    }

    async fn run(self, mut listener: ChangeListener, mut shutdown: oneshot::Receiver<()>) {
        self.scan().await;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                notice = listener.next() => match notice {
                    Some(_) => self.scan().await,
                    None => break,
                },
            }
        }
        debug!("dispatcher stopped");
    }

    /// One level-triggered pass over every visible WAITING record. Each
    /// newly claimed record executes on its own task.
    async fn scan(&self) {
        let waiting = match self.store.query(&RecordFilter::waiting()).await {
            Ok(records) => records,
            Err(err) => {
                // Availability error: no terminal state produced, the next
                // notice triggers another scan.
                warn!(error = %err, "scan query failed");
                return;
            }
        };
        for record in waiting {
            if !self.claim(record.id) {
                continue;
            }
            let worker = Worker {
                store: Arc::clone(&self.store),
                router: Arc::clone(&self.router),
                app: Arc::clone(&self.app),
                seen: Arc::clone(&self.seen),
                on_error: self.on_error.clone(),
            };
            tokio::spawn(worker.execute(record));
        }
    }

    fn claim(&self, id: CallId) -> bool {
        self.seen.lock().expect("seen set poisoned").insert(id)
    }
}

/// Per-record execution state handed to a spawned task.
struct Worker<S, C> {
    store: Arc<S>,
    router: Arc<Router<C>>,
    app: Arc<C>,
    seen: Arc<Mutex<SeenIds>>,
    on_error: Option<ErrorCallback>,
}

impl<S, C> Worker<S, C>
where
    S: CallStore + 'static,
    C: Send + Sync + 'static,
{
    /// Un-claim the id so a later scan retries the record.
    fn reopen(&self, id: CallId) {
        self.seen.lock().expect("seen set poisoned").remove(&id);
    }

    async fn execute(self, record: CallRecord) {
        if record.response.is_some() {
            // Protocol violation; leave it claimed so it is not retried.
            warn!(call_id = %record.id, "skipping malformed record: response present while WAITING");
            return;
        }

        debug!(call_id = %record.id, path = %record.path, "executing procedure");
        let ctx = ProcedureContext::new(Arc::clone(&self.app), &record);
        let result = self
            .router
            .dispatch(&record.path, record.call_type, record.input.clone(), ctx.clone())
            .await;

        match result {
            Ok(value) => {
                // Staged effects first, terminal write last: a crash in
                // between leaves the record WAITING, never falsely DONE.
                for effect in ctx.take_staged() {
                    if let Err(err) = effect.await {
                        warn!(call_id = %record.id, error = %err, "staged effect failed, retrying on a later scan");
                        self.reopen(record.id);
                        return;
                    }
                }
                let response = ctx.take_response().unwrap_or(value);
                if let Err(err) = self
                    .store
                    .update(record.id, RecordPatch::done(response))
                    .await
                {
                    warn!(call_id = %record.id, error = %err, "terminal write failed, retrying on a later scan");
                    self.reopen(record.id);
                }
            }
            Err(shape) => {
                debug!(call_id = %record.id, code = %shape.code, "procedure failed");
                if let Err(err) = self
                    .store
                    .update(record.id, RecordPatch::error(&shape))
                    .await
                {
                    warn!(call_id = %record.id, error = %err, "error write failed, retrying on a later scan");
                    self.reopen(record.id);
                    return;
                }
                if let Some(callback) = &self.on_error {
                    callback(&ErrorReport {
                        error: shape,
                        path: record.path,
                        call_type: record.call_type,
                        input: record.input,
                        client_id: record.client_id,
                    });
                }
            }
        }
    }
}

/// Handle to a spawned dispatcher.
pub struct DispatcherHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop the scan loop and wait for it to wind down.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use replicall_core::{CallState, CallType, ClientId};
    use replicall_store::{CallTable, TableStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    fn waiting(path: &str, input: Value) -> CallRecord {
        CallRecord::new(
            CallId::now_v7(),
            ClientId::now_v7(),
            path,
            input,
            CallType::Mutation,
        )
    }

    fn echo_router() -> Router<AtomicUsize> {
        Router::new().mutation("echo", |input, ctx: ProcedureContext<AtomicUsize>| async move {
            ctx.app().fetch_add(1, Ordering::SeqCst);
            Ok(input)
        })
    }

    async fn wait_for_terminal(store: &TableStore, id: CallId) -> CallRecord {
        for _ in 0..200 {
            if let Some(record) = store.get(id).await.unwrap() {
                if record.is_terminal() {
                    return record;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("record {id} never reached a terminal state");
    }

    #[test]
    fn test_seen_ids_dedup_and_eviction() {
        let mut seen = SeenIds::new(2);
        let a = CallId::now_v7();
        let b = CallId::now_v7();
        let c = CallId::now_v7();
        assert!(seen.insert(a));
        assert!(!seen.insert(a));
        assert!(seen.insert(b));
        assert!(seen.insert(c));
        // a evicted by the bound; b/c retained.
        assert!(!seen.contains(&a));
        assert!(seen.contains(&b));
        assert!(seen.contains(&c));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_seen_ids_remove_reopens_id() {
        let mut seen = SeenIds::new(8);
        let a = CallId::now_v7();
        assert!(seen.insert(a));
        seen.remove(&a);
        assert!(seen.insert(a));
    }

    #[tokio::test]
    async fn test_executes_waiting_record_and_commits_done() {
        let table = CallTable::new();
        let store = Arc::new(table.connect());
        let handle = Dispatcher::new(Arc::clone(&store), echo_router(), AtomicUsize::new(0)).spawn();

        let record = waiting("echo", json!({ "x": 1 }));
        store.create(&record).await.unwrap();

        let done = wait_for_terminal(&store, record.id).await;
        assert_eq!(done.state, CallState::Done);
        assert_eq!(done.response, Some(json!({ "x": 1 })));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_path_commits_error_and_reports() {
        let table = CallTable::new();
        let store = Arc::new(table.connect());
        let reports = Arc::new(Mutex::new(Vec::new()));
        let seen_reports = Arc::clone(&reports);
        let handle = Dispatcher::new(Arc::clone(&store), echo_router(), AtomicUsize::new(0))
            .on_error(move |report| {
                seen_reports.lock().unwrap().push(report.clone());
            })
            .spawn();

        let record = waiting("missing", json!(null));
        store.create(&record).await.unwrap();

        let failed = wait_for_terminal(&store, record.id).await;
        assert_eq!(failed.state, CallState::Error);
        let shape = failed.error_shape().unwrap();
        assert_eq!(shape.code, replicall_core::code::NOT_FOUND);

        handle.shutdown().await;
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].path, "missing");
    }

    #[tokio::test]
    async fn test_redundant_notices_execute_once() {
        let table = CallTable::new();
        let store = Arc::new(table.connect());
        let counter = Arc::new(AtomicUsize::new(0));
        let router = {
            let counter = Arc::clone(&counter);
            Router::new().mutation("count", move |_input, _ctx: ProcedureContext<()>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("ok"))
                }
            })
        };
        let handle = Dispatcher::new(Arc::clone(&store), router, ()).spawn();

        let record = waiting("count", json!(null));
        store.create(&record).await.unwrap();
        wait_for_terminal(&store, record.id).await;

        // Spurious notices: elapsed-only patches fire the change bus but
        // leave the waiting set unchanged.
        for i in 0..10 {
            store
                .update(record.id, RecordPatch::elapsed(i))
                .await
                .unwrap();
        }
        sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
