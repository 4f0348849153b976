//! REPLICALL Server - Dispatcher Side
//!
//! Watches the replicated store for WAITING call records, executes the
//! named procedure exactly once per process lifetime, and writes the
//! terminal state back into the record.

pub mod context;
pub mod dispatcher;
pub mod router;

pub use context::{ProcedureContext, StagedEffect};
pub use dispatcher::{Dispatcher, DispatcherHandle, ErrorReport, SeenIds};
pub use router::{parse_input, Router};
