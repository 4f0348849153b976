//! Per-call procedure context: app state plus staged side effects.

use futures_util::future::BoxFuture;
use replicall_core::{CallId, CallRecord, CallType, ClientId, ReplicallResult};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// A side effect staged during execution, applied by the dispatcher
/// atomically with the terminal-state commit (effects first, terminal
/// write last). Never applied when the procedure fails.
pub type StagedEffect = BoxFuture<'static, ReplicallResult<()>>;

/// Context handed to every procedure invocation.
///
/// Cheap to clone; all clones share the same staged-effect list, so the
/// dispatcher drains what the procedure registered.
pub struct ProcedureContext<C> {
    app: Arc<C>,
    call_id: CallId,
    client_id: ClientId,
    call_type: CallType,
    staged: Arc<Mutex<Vec<StagedEffect>>>,
    response_override: Arc<Mutex<Option<Value>>>,
}

impl<C> Clone for ProcedureContext<C> {
    fn clone(&self) -> Self {
        Self {
            app: Arc::clone(&self.app),
            call_id: self.call_id,
            client_id: self.client_id,
            call_type: self.call_type,
            staged: Arc::clone(&self.staged),
            response_override: Arc::clone(&self.response_override),
        }
    }
}

impl<C> ProcedureContext<C> {
    pub fn new(app: Arc<C>, record: &CallRecord) -> Self {
        Self {
            app,
            call_id: record.id,
            client_id: record.client_id,
            call_type: record.call_type,
            staged: Arc::new(Mutex::new(Vec::new())),
            response_override: Arc::new(Mutex::new(None)),
        }
    }

    /// Application context injected at dispatcher construction.
    pub fn app(&self) -> &C {
        &self.app
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Stage a side effect to run with the terminal commit. A
    /// post-registration failure in the procedure drops the effect
    /// unapplied, so a throw never leaves partial state.
    pub fn transact<Fut>(&self, effect: Fut)
    where
        Fut: Future<Output = ReplicallResult<()>> + Send + 'static,
    {
        self.staged
            .lock()
            .expect("staged effects poisoned")
            .push(Box::pin(effect));
    }

    /// Override the response payload written with the terminal state.
    /// Without an override the procedure's return value is used.
    pub fn set_response(&self, value: Value) {
        *self
            .response_override
            .lock()
            .expect("response override poisoned") = Some(value);
    }

    /// Drain the staged effects, in registration order.
    pub(crate) fn take_staged(&self) -> Vec<StagedEffect> {
        std::mem::take(&mut *self.staged.lock().expect("staged effects poisoned"))
    }

    pub(crate) fn take_response(&self) -> Option<Value> {
        self.response_override
            .lock()
            .expect("response override poisoned")
            .take()
    }
}
