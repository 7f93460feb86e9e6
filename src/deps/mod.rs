// src/deps/mod.rs
//! Data dependency engine
//!
//! Gates tasks on the access modes they declare. Each handle grants either
//! one writer or any number of accessors sharing the same non-write mode;
//! everything else waits in the handle's requester list, served in arrival
//! order. A task acquires its handles one at a time in handle-id order,
//! which rules out circular waits between tasks.

pub mod concurrency;

pub use concurrency::{
    acquire_data, attempt_to_submit_data_request, notify_data_dependencies, release_task_data,
    submit_job_enforce_data_deps, Attempt,
};

use crate::task::TaskRef;

/// Receives tasks whose every handle was granted
pub trait ReadySink: Send + Sync {
    fn push_ready(&self, task: TaskRef);
}
