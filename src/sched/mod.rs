// src/sched/mod.rs
//! Scheduling
//!
//! Workers and their topology, scheduling contexts, the policy interface
//! with its built-in policies, and the component tree the modular policies
//! are assembled from.

pub mod context;
pub mod env;
pub mod policies;
pub mod policy;
pub mod queue;
pub mod tree;
pub mod worker;

// Re-export commonly used types
pub use context::{CtxId, SchedContext, SchedContexts};
pub use env::{NoopWaker, Prefetcher, SchedEnv, WorkerWaker};
pub use policy::{create_policy, worker_may_execute_task, SchedPolicy};
pub use queue::{QueueEstimates, TaskQueue};
pub use worker::{current_worker, set_current_worker, ArchKind, Topology, WorkerDescr, WorkerId, WorkerMask};
