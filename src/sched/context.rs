// src/sched/context.rs
//! Scheduling contexts
//!
//! A context is a named set of workers scheduled by its own policy. The
//! initial context holds every worker; further contexts may share workers
//! with it. A worker pops from every context it belongs to, lowest id
//! first.

use crate::sched::env::SchedEnv;
use crate::sched::policy::{create_policy, SchedPolicy};
use crate::sched::worker::{WorkerId, WorkerMask};
use crate::task::TaskRef;
use crate::utils::errors::{Result, RuntimeError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CtxId(pub usize);

impl CtxId {
    /// Context created at startup with every worker
    pub const INITIAL: CtxId = CtxId(0);
}

impl fmt::Display for CtxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One scheduling context
pub struct SchedContext {
    id: CtxId,
    name: String,
    policy: Box<dyn SchedPolicy>,
    workers: RwLock<WorkerMask>,
    nsubmitted: AtomicUsize,
    nfinished: AtomicUsize,
}

impl SchedContext {
    pub fn id(&self) -> CtxId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &dyn SchedPolicy {
        self.policy.as_ref()
    }

    pub fn workers(&self) -> WorkerMask {
        self.workers.read().clone()
    }

    pub fn contains(&self, worker: WorkerId) -> bool {
        self.workers.read().contains(worker)
    }

    pub(crate) fn task_submitted(&self) {
        self.nsubmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_finished(&self) {
        self.nfinished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn nsubmitted(&self) -> usize {
        self.nsubmitted.load(Ordering::Relaxed)
    }

    pub fn nfinished(&self) -> usize {
        self.nfinished.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for SchedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("policy", &self.policy.name())
            .field("workers", &self.workers.read().len())
            .finish()
    }
}

/// Registry of the live contexts
pub struct SchedContexts {
    env: Arc<SchedEnv>,
    contexts: RwLock<BTreeMap<CtxId, Arc<SchedContext>>>,
    next_id: AtomicUsize,
}

impl SchedContexts {
    /// Create the registry with the initial context over every worker
    pub fn new(env: Arc<SchedEnv>, policy: &str) -> Result<Self> {
        let registry = Self {
            env,
            contexts: RwLock::new(BTreeMap::new()),
            next_id: AtomicUsize::new(CtxId::INITIAL.0),
        };
        let workers: Vec<WorkerId> = registry.env.topology.all_workers().iter().collect();
        registry.create("initial", policy, &workers)?;
        Ok(registry)
    }

    pub fn env(&self) -> &Arc<SchedEnv> {
        &self.env
    }

    /// Create a context scheduling `workers` with `policy`
    pub fn create(&self, name: &str, policy: &str, workers: &[WorkerId]) -> Result<CtxId> {
        self.check_workers(workers)?;
        let policy = create_policy(policy, Arc::clone(&self.env), workers)?;
        let id = CtxId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let context = SchedContext {
            id,
            name: name.to_string(),
            policy,
            workers: RwLock::new(workers.iter().copied().collect()),
            nsubmitted: AtomicUsize::new(0),
            nfinished: AtomicUsize::new(0),
        };
        info!(
            ctx = %id,
            name,
            policy = context.policy.name(),
            nworkers = workers.len(),
            "Scheduling context created"
        );
        self.contexts.write().insert(id, Arc::new(context));
        Ok(id)
    }

    /// Delete a context, handing its queued tasks to the initial context
    pub fn delete(&self, ctx: CtxId) -> Result<()> {
        if ctx == CtxId::INITIAL {
            return Err(RuntimeError::InvalidConfig(
                "the initial context cannot be deleted".to_string(),
            ));
        }
        let context = self
            .contexts
            .write()
            .remove(&ctx)
            .ok_or(RuntimeError::UnknownContext(ctx))?;
        let inheritor = self.get(CtxId::INITIAL)?;

        let orphans = context.policy.pop_every_task();
        debug!(ctx = %ctx, ntasks = orphans.len(), "Moving tasks to the initial context");
        for task in orphans {
            if let Err(err) = inheritor.policy.push_task(Arc::clone(&task)) {
                warn!(task = %task.id(), error = %err, "Task lost while deleting a context");
            }
        }
        info!(ctx = %ctx, name = context.name(), "Scheduling context deleted");
        Ok(())
    }

    pub fn add_workers(&self, ctx: CtxId, workers: &[WorkerId]) -> Result<()> {
        self.check_workers(workers)?;
        let context = self.get(ctx)?;
        {
            let mut mask = context.workers.write();
            for worker in workers {
                mask.insert(*worker);
            }
        }
        context.policy.add_workers(workers);
        debug!(ctx = %ctx, ?workers, "Workers added");
        Ok(())
    }

    pub fn remove_workers(&self, ctx: CtxId, workers: &[WorkerId]) -> Result<()> {
        let context = self.get(ctx)?;
        {
            let mut mask = context.workers.write();
            for worker in workers {
                mask.remove(*worker);
            }
        }
        context.policy.remove_workers(workers);
        debug!(ctx = %ctx, ?workers, "Workers removed");
        Ok(())
    }

    pub fn get(&self, ctx: CtxId) -> Result<Arc<SchedContext>> {
        self.contexts
            .read()
            .get(&ctx)
            .cloned()
            .ok_or(RuntimeError::UnknownContext(ctx))
    }

    /// Contexts `worker` belongs to, lowest id first
    pub fn of_worker(&self, worker: WorkerId) -> Vec<Arc<SchedContext>> {
        self.contexts
            .read()
            .values()
            .filter(|context| context.contains(worker))
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<CtxId> {
        self.contexts.read().keys().copied().collect()
    }

    /// Hand a ready task to the policy of its context
    pub fn push_task(&self, task: TaskRef) -> Result<()> {
        let context = self.get(task.ctx())?;
        context.policy.push_task(Arc::clone(&task))?;
        self.env
            .counters
            .notify_pushed_task(context.id, task.sched_info().worker);
        Ok(())
    }

    /// Next task for `worker` from any of its contexts
    pub fn pop_task(&self, worker: WorkerId) -> Option<(Arc<SchedContext>, TaskRef)> {
        for context in self.of_worker(worker) {
            if let Some(task) = context.policy.pop_task(worker) {
                self.env.counters.notify_poped_task(context.id, worker);
                return Some((context, task));
            }
        }
        None
    }

    /// Queued tasks over every context
    pub fn ntasks(&self) -> usize {
        self.contexts
            .read()
            .values()
            .map(|context| context.policy.ntasks())
            .sum()
    }

    fn check_workers(&self, workers: &[WorkerId]) -> Result<()> {
        match workers
            .iter()
            .find(|worker| self.env.topology.worker(**worker).is_none())
        {
            Some(unknown) => Err(RuntimeError::UnknownWorker(*unknown)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perfmodel::{ModelEstimator, TransferModel};
    use crate::sched::Topology;
    use crate::task::Task;
    use crate::utils::config::TopologyConfig;

    fn registry(policy: &str) -> SchedContexts {
        let topology = Arc::new(Topology::from_config(&TopologyConfig {
            ncpus: 3,
            ..Default::default()
        }));
        let estimator = Arc::new(ModelEstimator::new(TransferModel::from_nodes(topology.nodes())));
        let env = Arc::new(SchedEnv::new(topology, estimator, Default::default()));
        SchedContexts::new(env, policy).unwrap()
    }

    #[test]
    fn test_initial_context_has_every_worker() {
        let contexts = registry("eager");
        let initial = contexts.get(CtxId::INITIAL).unwrap();
        assert_eq!(initial.workers().len(), 3);
        assert_eq!(initial.policy().name(), "eager");
    }

    #[test]
    fn test_tasks_follow_their_context() {
        let contexts = registry("eager");
        let ctx = contexts.create("solver", "prio", &[WorkerId(2)]).unwrap();
        assert_eq!(ctx, CtxId(1));

        let task = Task::control().context(ctx).build();
        contexts.push_task(Arc::clone(&task)).unwrap();

        assert!(contexts.pop_task(WorkerId(0)).is_none());
        let (context, popped) = contexts.pop_task(WorkerId(2)).unwrap();
        assert_eq!(context.id(), ctx);
        assert_eq!(popped.id(), task.id());
    }

    #[test]
    fn test_delete_moves_tasks_to_initial() {
        let contexts = registry("eager");
        let ctx = contexts.create("tmp", "eager", &[WorkerId(1)]).unwrap();
        contexts
            .push_task(Task::control().context(ctx).build())
            .unwrap();
        contexts.delete(ctx).unwrap();

        assert!(matches!(contexts.get(ctx), Err(RuntimeError::UnknownContext(_))));
        assert!(contexts.pop_task(WorkerId(0)).is_some());
        assert!(contexts.delete(CtxId::INITIAL).is_err());
    }

    #[test]
    fn test_worker_membership() {
        let contexts = registry("eager");
        let ctx = contexts.create("io", "eager", &[]).unwrap();
        contexts.add_workers(ctx, &[WorkerId(0)]).unwrap();
        assert_eq!(contexts.of_worker(WorkerId(0)).len(), 2);
        contexts.remove_workers(ctx, &[WorkerId(0)]).unwrap();
        assert_eq!(contexts.of_worker(WorkerId(0)).len(), 1);
        assert!(matches!(
            contexts.add_workers(ctx, &[WorkerId(9)]),
            Err(RuntimeError::UnknownWorker(_))
        ));
    }
}
