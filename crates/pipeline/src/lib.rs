#![forbid(unsafe_code)]

pub mod api;
pub mod assets;
pub mod cache;
pub mod clock;
pub mod codegen;
pub mod config;
pub mod error;
pub mod gates;
pub mod lease;
pub mod model;
pub mod orchestrator;
pub mod phases;
pub mod progress;
pub mod services;
pub mod signature;
pub mod verify_scheduler;

pub use error::PipelineError;

use sm_storage::SqliteStore;
use std::sync::{Arc, Mutex, MutexGuard};

/// One store connection shared by every component of a worker.
pub type SharedStore = Arc<Mutex<SqliteStore>>;

pub fn shared_store(store: SqliteStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

pub(crate) fn lock_store(store: &SharedStore) -> Result<MutexGuard<'_, SqliteStore>, PipelineError> {
    store.lock().map_err(|_| PipelineError::StorePoisoned)
}
