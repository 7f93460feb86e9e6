// src/sched/policies/modular.rs
//! Policies assembled from scheduling components
//!
//! Each recipe builds a fixed upper part once, then grows one branch per
//! worker as workers join the context:
//!
//! ```text
//! eager / prio      fifo|prio ─ eager ─┬─ worker 0
//!                                      └─ worker 1
//!
//! random            random ─┬─ fifo|prio ─ worker 0
//!                           └─ fifo|prio ─ worker 1
//!
//! ws                work stealing ─┬─ worker 0
//!                                  └─ worker 1
//!
//! heft              perfmodel select ─┬─ eager (calibration) ──────┐
//!                                     ├─ best impl ─ eager ────────┤
//!                                     └─ heft ─────────────────────┴─ prio ─ worker n
//! ```

use crate::sched::env::SchedEnv;
use crate::sched::policy::SchedPolicy;
use crate::sched::tree::{ComponentId, ComponentSpec, SchedTree};
use crate::sched::worker::{WorkerId, WorkerMask};
use crate::task::TaskRef;
use crate::utils::errors::{Result, RuntimeError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shape of a component-based policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModularRecipe {
    Eager,
    Prio,
    Random { prio: bool },
    WorkStealing { keep_local: bool },
    Heft,
}

impl ModularRecipe {
    pub fn name(self) -> &'static str {
        match self {
            ModularRecipe::Eager => "modular-eager",
            ModularRecipe::Prio => "modular-prio",
            ModularRecipe::Random { prio: false } => "modular-random",
            ModularRecipe::Random { prio: true } => "modular-random-prio",
            ModularRecipe::WorkStealing { keep_local: true } => "ws",
            ModularRecipe::WorkStealing { keep_local: false } => "modular-ws",
            ModularRecipe::Heft => "modular-heft",
        }
    }

    /// Queue inserted above each worker leaf, if any
    fn worker_queue(self) -> Option<ComponentSpec> {
        match self {
            ModularRecipe::Random { prio: false } => Some(ComponentSpec::Fifo { bounded: true }),
            ModularRecipe::Random { prio: true } | ModularRecipe::Heft => {
                Some(ComponentSpec::Prio { bounded: true })
            }
            _ => None,
        }
    }
}

/// Components of one worker's branch
#[derive(Debug, Clone, Copy)]
struct Branch {
    queue: Option<ComponentId>,
    leaf: ComponentId,
}

impl Branch {
    /// Component attached to the shared upper part
    fn head(&self) -> ComponentId {
        self.queue.unwrap_or(self.leaf)
    }
}

pub struct TreePolicy {
    recipe: ModularRecipe,
    tree: SchedTree,
    /// Parents of every branch head, pop father first
    attach: Vec<ComponentId>,
    branches: Mutex<HashMap<WorkerId, Branch>>,
    workers: RwLock<WorkerMask>,
}

impl TreePolicy {
    pub fn new(env: Arc<SchedEnv>, recipe: ModularRecipe) -> Self {
        let tree = SchedTree::new(env);
        let (root, attach) = match recipe {
            ModularRecipe::Eager | ModularRecipe::Prio => {
                let queue = if recipe == ModularRecipe::Prio {
                    ComponentSpec::Prio { bounded: false }
                } else {
                    ComponentSpec::Fifo { bounded: false }
                };
                let top = Self::compose(&tree, &[queue, ComponentSpec::Eager]);
                (top, vec![tree.bottom(top)])
            }
            ModularRecipe::Random { .. } => {
                let random = tree.create(ComponentSpec::Random);
                (random, vec![random])
            }
            ModularRecipe::WorkStealing { keep_local } => {
                let ws = tree.create(ComponentSpec::WorkStealing { keep_local });
                (ws, vec![ws])
            }
            ModularRecipe::Heft => {
                let calibrator = tree.create(ComponentSpec::Eager);
                let no_model = Self::compose(
                    &tree,
                    &[ComponentSpec::BestImplementation, ComponentSpec::Eager],
                );
                let heft = tree.create(ComponentSpec::Heft);
                let select = tree.perfmodel_select(calibrator, no_model, heft);
                (select, vec![heft, calibrator, tree.bottom(no_model)])
            }
        };
        tree.set_root(root);
        debug!(policy = recipe.name(), "Scheduling tree built");
        Self {
            recipe,
            tree,
            attach,
            branches: Mutex::new(HashMap::new()),
            workers: RwLock::new(WorkerMask::new()),
        }
    }

    fn compose(tree: &SchedTree, recipe: &[ComponentSpec]) -> ComponentId {
        // Recipes are never empty
        match tree.compose(recipe) {
            Some(id) => id,
            None => tree.create(ComponentSpec::Eager),
        }
    }

    pub fn tree(&self) -> &SchedTree {
        &self.tree
    }

    fn branch(&self, worker: WorkerId) -> Branch {
        let mut branches = self.branches.lock();
        *branches.entry(worker).or_insert_with(|| {
            let leaf = self.tree.worker_component(worker);
            let queue = self.recipe.worker_queue().map(|spec| {
                let queue = self.tree.create(spec);
                self.tree.add_child(queue, leaf);
                queue
            });
            Branch { queue, leaf }
        })
    }

    fn repush(&self, tasks: Vec<TaskRef>) {
        for task in tasks {
            if let Err(err) = self.tree.push_task(Arc::clone(&task)) {
                warn!(task = %task.id(), error = %err, "Task lost with its worker");
            }
        }
    }
}

impl SchedPolicy for TreePolicy {
    fn name(&self) -> &'static str {
        self.recipe.name()
    }

    fn add_workers(&self, workers: &[WorkerId]) {
        let mut mask = self.workers.write();
        for worker in workers {
            if mask.contains(*worker) || self.tree.env().worker(*worker).is_none() {
                continue;
            }
            let head = self.branch(*worker).head();
            for parent in &self.attach {
                self.tree.add_child(*parent, head);
            }
            mask.insert(*worker);
        }
        self.tree.set_ctx_workers(&mask);
    }

    fn remove_workers(&self, workers: &[WorkerId]) {
        let mut orphans = Vec::new();
        {
            let mut mask = self.workers.write();
            for worker in workers {
                if !mask.contains(*worker) {
                    continue;
                }
                mask.remove(*worker);
                let branch = self.branch(*worker);
                for parent in &self.attach {
                    orphans.extend(self.tree.remove_child(*parent, branch.head()));
                }
                if let Some(queue) = branch.queue {
                    orphans.extend(self.tree.drain(queue));
                }
                orphans.extend(self.tree.drain(branch.leaf));
            }
            self.tree.set_ctx_workers(&mask);
        }
        self.repush(orphans);
    }

    fn push_task(&self, task: TaskRef) -> Result<()> {
        if self.workers.read().is_empty() {
            return Err(RuntimeError::NoDevice(task.id()));
        }
        self.tree.push_task(task)
    }

    fn pop_task(&self, worker: WorkerId) -> Option<TaskRef> {
        self.tree.pop_task(worker)
    }

    fn pre_exec_hook(&self, task: &TaskRef, worker: WorkerId) {
        self.tree.worker_started(worker, task);
    }

    fn post_exec_hook(&self, _task: &TaskRef, worker: WorkerId) {
        self.tree.worker_finished(worker);
    }

    fn pop_every_task(&self) -> Vec<TaskRef> {
        self.tree.pop_every_task()
    }

    fn ntasks(&self) -> usize {
        self.tree.ntasks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perfmodel::FixedModel;
    use crate::sched::tree::tests::{cpu_task, cuda_task, env};
    use crate::sched::worker::ArchKind;
    use crate::task::{Codelet, Task};

    fn policy(recipe: ModularRecipe, ncpus: usize, ncuda: usize) -> TreePolicy {
        let policy = TreePolicy::new(env(ncpus, ncuda), recipe);
        policy.add_workers(&(0..ncpus + ncuda).map(WorkerId).collect::<Vec<_>>());
        policy
    }

    fn drain_worker(policy: &TreePolicy, worker: WorkerId) -> Vec<TaskRef> {
        std::iter::from_fn(|| policy.pop_task(worker)).collect()
    }

    #[test]
    fn test_eager_shares_one_queue() {
        let policy = policy(ModularRecipe::Eager, 2, 0);
        let tasks: Vec<_> = (0..4).map(|_| cpu_task()).collect();
        for task in &tasks {
            policy.push_task(Arc::clone(task)).unwrap();
        }
        assert_eq!(policy.pop_task(WorkerId(1)).unwrap().id(), tasks[0].id());
        assert_eq!(policy.pop_task(WorkerId(0)).unwrap().id(), tasks[1].id());
        assert_eq!(policy.ntasks(), 2);
    }

    #[test]
    fn test_prio_pops_highest_first() {
        let policy = policy(ModularRecipe::Prio, 1, 0);
        policy.push_task(Task::control().priority(1).build()).unwrap();
        let urgent = Task::control().priority(5).build();
        policy.push_task(Arc::clone(&urgent)).unwrap();
        assert_eq!(policy.pop_task(WorkerId(0)).unwrap().id(), urgent.id());
    }

    #[test]
    fn test_cuda_only_task_skips_cpus() {
        for recipe in [
            ModularRecipe::Eager,
            ModularRecipe::Random { prio: false },
            ModularRecipe::WorkStealing { keep_local: false },
            ModularRecipe::Heft,
        ] {
            let policy = policy(recipe, 2, 1);
            let task = cuda_task();
            policy.push_task(Arc::clone(&task)).unwrap();
            assert!(policy.pop_task(WorkerId(0)).is_none(), "{}", recipe.name());
            assert!(policy.pop_task(WorkerId(1)).is_none(), "{}", recipe.name());
            assert_eq!(policy.pop_task(WorkerId(2)).unwrap().id(), task.id());
        }
    }

    #[test]
    fn test_heft_places_modelled_tasks() {
        let policy = policy(ModularRecipe::Heft, 2, 0);
        let codelet = Arc::new(
            Codelet::new("kernel", 0)
                .with_implementation(ArchKind::Cpu, |_| {})
                .with_model(Arc::new(FixedModel::new().with_length(ArchKind::Cpu, 10.0))),
        );
        let a = Task::builder(Arc::clone(&codelet)).build();
        let b = Task::builder(codelet).build();
        policy.push_task(Arc::clone(&a)).unwrap();
        policy.push_task(Arc::clone(&b)).unwrap();

        assert_eq!(a.predicted(), Some(10.0));
        assert_eq!(drain_worker(&policy, WorkerId(0)).len(), 1);
        assert_eq!(drain_worker(&policy, WorkerId(1)).len(), 1);
    }

    #[test]
    fn test_heft_routes_unmodelled_tasks_through_best_implementation() {
        let policy = policy(ModularRecipe::Heft, 1, 0);
        let task = cpu_task();
        policy.push_task(Arc::clone(&task)).unwrap();
        assert_eq!(task.predicted(), None);
        assert_eq!(policy.pop_task(WorkerId(0)).unwrap().id(), task.id());
    }

    #[test]
    fn test_removed_worker_tasks_move() {
        let policy = policy(ModularRecipe::Random { prio: false }, 2, 0);
        for _ in 0..8 {
            policy.push_task(cpu_task()).unwrap();
        }
        policy.remove_workers(&[WorkerId(0)]);
        assert!(policy.pop_task(WorkerId(0)).is_none());
        assert_eq!(drain_worker(&policy, WorkerId(1)).len(), 8);

        policy.add_workers(&[WorkerId(0)]);
        policy.push_task(cpu_task()).unwrap();
        assert_eq!(policy.ntasks(), 1);
    }

    #[test]
    fn test_work_stealing_keeps_every_task() {
        let policy = policy(ModularRecipe::WorkStealing { keep_local: true }, 3, 0);
        assert_eq!(policy.name(), "ws");
        for _ in 0..9 {
            policy.push_task(cpu_task()).unwrap();
        }
        // One worker alone empties the whole tree by stealing
        assert_eq!(drain_worker(&policy, WorkerId(2)).len(), 9);
    }

    #[test]
    fn test_no_workers_is_no_device() {
        let policy = TreePolicy::new(env(1, 0), ModularRecipe::Eager);
        assert!(matches!(
            policy.push_task(cpu_task()),
            Err(RuntimeError::NoDevice(_))
        ));
    }
}
