// src/sched/policy.rs
//! Scheduling policy interface and registry

use crate::memory::NodeId;
use crate::sched::env::SchedEnv;
use crate::sched::policies::{
    CentralQueuePolicy, DequeModelPolicy, DmVariant, ModularRecipe, RandomPolicy, TreePolicy,
};
use crate::sched::worker::{WorkerDescr, WorkerId};
use crate::task::{Task, TaskRef};
use crate::utils::errors::{Result, RuntimeError};
use std::sync::Arc;

/// A scheduling strategy for one context
///
/// `push_task` is called by the dependency engine once a task's data is
/// available, `pop_task` by idle workers.
pub trait SchedPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn add_workers(&self, workers: &[WorkerId]);

    fn remove_workers(&self, workers: &[WorkerId]);

    /// Hand a ready task to the policy
    ///
    /// Fails with [`RuntimeError::NoDevice`] when no worker of the context
    /// can run it, leaving every queue untouched.
    fn push_task(&self, task: TaskRef) -> Result<()>;

    fn pop_task(&self, worker: WorkerId) -> Option<TaskRef>;

    fn pre_exec_hook(&self, _task: &TaskRef, _worker: WorkerId) {}

    fn post_exec_hook(&self, _task: &TaskRef, _worker: WorkerId) {}

    /// Remove every queued task, for context deletion
    fn pop_every_task(&self) -> Vec<TaskRef>;

    /// Tasks currently queued
    fn ntasks(&self) -> usize;
}

/// Build the policy registered under `name` over `workers`
pub fn create_policy(
    name: &str,
    env: Arc<SchedEnv>,
    workers: &[WorkerId],
) -> Result<Box<dyn SchedPolicy>> {
    let policy: Box<dyn SchedPolicy> = match name {
        "eager" => Box::new(CentralQueuePolicy::eager(env)),
        "prio" => Box::new(CentralQueuePolicy::prio(env)),
        "random" => Box::new(RandomPolicy::new(env)),
        "ws" => Box::new(TreePolicy::new(env, ModularRecipe::WorkStealing { keep_local: true })),
        "heft" => Box::new(DequeModelPolicy::new(env, DmVariant::Heft)),
        "dm" => Box::new(DequeModelPolicy::new(env, DmVariant::Dm)),
        "dmda" => Box::new(DequeModelPolicy::new(env, DmVariant::Dmda)),
        "dmdas" => Box::new(DequeModelPolicy::new(env, DmVariant::Dmdas)),
        "dmdar" => Box::new(DequeModelPolicy::new(env, DmVariant::Dmdar)),
        "modular-eager" => Box::new(TreePolicy::new(env, ModularRecipe::Eager)),
        "modular-prio" => Box::new(TreePolicy::new(env, ModularRecipe::Prio)),
        "modular-random" => Box::new(TreePolicy::new(env, ModularRecipe::Random { prio: false })),
        "modular-random-prio" => {
            Box::new(TreePolicy::new(env, ModularRecipe::Random { prio: true }))
        }
        "modular-ws" => Box::new(TreePolicy::new(
            env,
            ModularRecipe::WorkStealing { keep_local: false },
        )),
        "modular-heft" => Box::new(TreePolicy::new(env, ModularRecipe::Heft)),
        other => return Err(RuntimeError::UnknownPolicy(other.to_string())),
    };
    policy.add_workers(workers);
    Ok(policy)
}

/// Whether `worker` has an implementation of the task's kernel
///
/// Control tasks run anywhere.
pub fn worker_may_execute_task(worker: &WorkerDescr, task: &Task) -> bool {
    match task.codelet() {
        Some(codelet) => codelet
            .implementations
            .iter()
            .any(|implementation| implementation.arch == worker.arch),
        None => true,
    }
}

/// Implementation indices usable by `worker`
pub fn implementations_for(worker: &WorkerDescr, task: &Task) -> Vec<usize> {
    match task.codelet() {
        Some(codelet) => (0..codelet.implementations.len())
            .filter(|&index| codelet.can_execute(worker.arch, index))
            .collect(),
        None => vec![0],
    }
}

/// Buffers of `task` neither valid on `node` nor on their way there
pub fn count_non_ready_buffers(task: &Task, node: NodeId) -> usize {
    task.ordered_buffers()
        .iter()
        .filter(|buffer| buffer.mode.reads())
        .filter(|buffer| {
            let header = buffer.handle.lock();
            let replicate = header.replicate(node);
            !replicate.is_valid() && replicate.request.is_none()
        })
        .count()
}
