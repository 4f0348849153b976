//! REPLICALL Test Utilities
//!
//! Centralized test infrastructure for the REPLICALL workspace:
//! - The shared user-directory fixture procedures exercise side effects on
//! - A ready-made router covering success, rejection, and delay paths
//! - Tracing init for integration tests

use once_cell::sync::Lazy;
use replicall_core::ErrorShape;
use replicall_server::{parse_input, ProcedureContext, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The rejection text `user.create` commits for the magic bad name.
pub const REJECTION_TEXT: &str = "This name isn't one I like to allow";

/// The name that makes `user.create` throw a CONFLICT.
pub const BAD_NAME: &str = "BAD_NAME";

/// Initialize tracing once for a test binary. Safe to call repeatedly.
pub fn init_tracing() {
    static INIT: Lazy<()> = Lazy::new(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
    Lazy::force(&INIT);
}

// ============================================================================
// USER DIRECTORY FIXTURE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
}

/// Shared mutable user list the staged side effects write into.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: Arc<Mutex<Vec<User>>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, user: User) {
        self.users.lock().expect("user directory poisoned").push(user);
    }

    pub fn rename(&self, id: &str, name: &str) -> bool {
        let mut users = self.users.lock().expect("user directory poisoned");
        match users.iter_mut().find(|user| user.id == id) {
            Some(user) => {
                user.name = name.to_string();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<User> {
        self.users
            .lock()
            .expect("user directory poisoned")
            .iter()
            .find(|user| user.id == id)
            .cloned()
    }

    pub fn all(&self) -> Vec<User> {
        self.users.lock().expect("user directory poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.users.lock().expect("user directory poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// App context injected into the test dispatcher.
#[derive(Debug, Clone, Default)]
pub struct TestApp {
    pub users: UserDirectory,
}

impl TestApp {
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// TEST ROUTER
// ============================================================================

#[derive(Debug, Deserialize)]
struct UserCreateInput {
    name: String,
    #[serde(default)]
    optional_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UserUpdateNameInput {
    id: String,
    name: String,
}

/// The shared test router:
/// - `user.create` (mutation): allocates the next id, optionally sleeps,
///   rejects [`BAD_NAME`] with a CONFLICT, and stages the directory write
///   so it only lands with a successful commit.
/// - `user.updateName` (mutation): stages a rename, returns `"ok"`.
/// - `user.list` (query): returns the directory.
pub fn user_router() -> Router<TestApp> {
    Router::new()
        .mutation("user.create", |input, ctx: ProcedureContext<TestApp>| async move {
            let input: UserCreateInput = parse_input(input)?;
            let users = ctx.app().users.clone();
            let user = User {
                id: (users.len() + 1).to_string(),
                name: input.name.clone(),
            };

            if let Some(delay_ms) = input.optional_delay_ms {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            if input.name == BAD_NAME {
                return Err(ErrorShape::conflict(REJECTION_TEXT));
            }

            let staged_user = user.clone();
            ctx.transact(async move {
                users.add(staged_user);
                Ok(())
            });

            Ok(json!(user))
        })
        .mutation(
            "user.updateName",
            |input, ctx: ProcedureContext<TestApp>| async move {
                let input: UserUpdateNameInput = parse_input(input)?;
                let users = ctx.app().users.clone();
                ctx.transact(async move {
                    users.rename(&input.id, &input.name);
                    Ok(())
                });
                Ok(json!("ok"))
            },
        )
        .query("user.list", |_input, ctx: ProcedureContext<TestApp>| async move {
            Ok(json!(ctx.app().users.all()))
        })
}
