//! Procedure router: path -> procedure, with the dispatch seam the
//! dispatcher calls into.

use crate::context::ProcedureContext;
use futures_util::future::BoxFuture;
use replicall_core::{CallType, ErrorShape};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;

type BoxProcedure<C> =
    Box<dyn Fn(Value, ProcedureContext<C>) -> BoxFuture<'static, Result<Value, ErrorShape>> + Send + Sync>;

struct Registration<C> {
    kind: CallType,
    run: BoxProcedure<C>,
}

/// Maps procedure paths to handlers. Built once, shared by the dispatcher.
pub struct Router<C> {
    procedures: HashMap<String, Registration<C>>,
}

impl<C: Send + Sync + 'static> Router<C> {
    pub fn new() -> Self {
        Self {
            procedures: HashMap::new(),
        }
    }

    /// Register a query procedure at `path`.
    pub fn query<F, Fut>(self, path: &str, procedure: F) -> Self
    where
        F: Fn(Value, ProcedureContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorShape>> + Send + 'static,
    {
        self.register(path, CallType::Query, procedure)
    }

    /// Register a mutation procedure at `path`.
    pub fn mutation<F, Fut>(self, path: &str, procedure: F) -> Self
    where
        F: Fn(Value, ProcedureContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorShape>> + Send + 'static,
    {
        self.register(path, CallType::Mutation, procedure)
    }

    fn register<F, Fut>(mut self, path: &str, kind: CallType, procedure: F) -> Self
    where
        F: Fn(Value, ProcedureContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorShape>> + Send + 'static,
    {
        let run: BoxProcedure<C> = Box::new(move |input, ctx| Box::pin(procedure(input, ctx)));
        self.procedures
            .insert(path.to_string(), Registration { kind, run });
        self
    }

    pub fn has(&self, path: &str) -> bool {
        self.procedures.contains_key(path)
    }

    /// Execute the procedure registered at `path`.
    ///
    /// Unknown paths and kind mismatches come back as error shapes, so
    /// they travel the same path as procedure-thrown errors.
    pub async fn dispatch(
        &self,
        path: &str,
        call_type: CallType,
        input: Value,
        ctx: ProcedureContext<C>,
    ) -> Result<Value, ErrorShape> {
        let registration = self
            .procedures
            .get(path)
            .ok_or_else(|| ErrorShape::not_found(format!("No procedure on path `{path}`")))?;
        if registration.kind != call_type {
            return Err(ErrorShape::method_not_supported(format!(
                "Procedure `{path}` is registered as {:?}, called as {:?}",
                registration.kind, call_type
            )));
        }
        (registration.run)(input, ctx).await
    }
}

impl<C: Send + Sync + 'static> Default for Router<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deserialize a procedure input, surfacing failures as `BAD_REQUEST`
/// shapes so input errors travel the same path as execution errors.
pub fn parse_input<T: DeserializeOwned>(input: Value) -> Result<T, ErrorShape> {
    serde_json::from_value(input).map_err(|err| ErrorShape::bad_request(format!("Invalid input: {err}")))
}

// =============================================================================
// TESTS
// =============================================================================
