// src/utils/errors.rs
//! Runtime error types
//!
//! Internal subsystems never panic on recoverable conditions. Every fallible
//! entry point returns [`Result`] and the caller decides between retrying
//! (out of memory, pending copy) and propagating (no device).

use crate::data::HandleId;
use crate::memory::NodeId;
use crate::sched::{CtxId, WorkerId};
use crate::task::TaskId;
use thiserror::Error;

/// Errors surfaced by the runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No worker of the scheduling context can execute the task
    #[error("no worker can execute task {0}")]
    NoDevice(TaskId),

    /// Allocation failed even after reclaiming memory
    #[error("out of memory on node {node} ({requested} bytes requested)")]
    OutOfMemory { node: NodeId, requested: usize },

    /// An asynchronous copy is still in flight
    #[error("operation pending, try again")]
    Again,

    #[error("data handle {0} is busy")]
    HandleBusy(HandleId),

    #[error("data handle {0} is partitioned")]
    Partitioned(HandleId),

    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    #[error("unknown scheduling policy: {0}")]
    UnknownPolicy(String),

    #[error("unknown scheduling context: {0}")]
    UnknownContext(CtxId),

    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("task bundle is closed")]
    BundleClosed,

    #[error("task {0} was already submitted")]
    AlreadySubmitted(TaskId),

    #[error("task {0} is not part of the bundle")]
    NotInBundle(TaskId),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("observability setup failed: {0}")]
    Observability(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("runtime is shut down")]
    ShutDown,
}

impl RuntimeError {
    /// Negative errno value expected by device drivers
    pub fn errno(&self) -> i32 {
        match self {
            RuntimeError::NoDevice(_) => -libc::ENODEV,
            RuntimeError::OutOfMemory { .. } => -libc::ENOMEM,
            RuntimeError::Again => -libc::EAGAIN,
            RuntimeError::HandleBusy(_) => -libc::EBUSY,
            RuntimeError::BundleClosed => -libc::EPERM,
            RuntimeError::NotInBundle(_) => -libc::ENOENT,
            RuntimeError::ShutDown => -libc::ESHUTDOWN,
            _ => -libc::EINVAL,
        }
    }

    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RuntimeError::OutOfMemory { .. } | RuntimeError::Again | RuntimeError::HandleBusy(_)
        )
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(RuntimeError::NoDevice(TaskId(1)).errno(), -libc::ENODEV);
        assert_eq!(
            RuntimeError::OutOfMemory {
                node: NodeId(0),
                requested: 4096
            }
            .errno(),
            -libc::ENOMEM
        );
        assert_eq!(RuntimeError::Again.errno(), -libc::EAGAIN);
        assert_eq!(RuntimeError::BundleClosed.errno(), -libc::EPERM);
    }

    #[test]
    fn test_transient_errors() {
        assert!(RuntimeError::Again.is_transient());
        assert!(!RuntimeError::NoDevice(TaskId(3)).is_transient());
    }

    #[test]
    fn test_display() {
        let err = RuntimeError::OutOfMemory {
            node: NodeId(2),
            requested: 40,
        };
        assert_eq!(err.to_string(), "out of memory on node 2 (40 bytes requested)");
    }
}
