// src/sched/tree/work_stealing.rs
//! Work-stealing component
//!
//! Every child owns a deque. Pushes are spread round-robin over the
//! children; a worker pops the head of its own deque and, when empty,
//! steals the tail of its siblings' deques.
//!
//! ```text
//!   child 0        child 1        child 2
//!  [t t t t]      [       ]      [t t]
//!   ↑ pop             │             ↑
//!   └─────────────────┴── steal ────┘ (tail)
//! ```

use crate::sched::policy::worker_may_execute_task;
use crate::sched::tree::{SchedComponent, SchedTree, TreeInner};
use crate::sched::worker::{current_worker, WorkerId};
use crate::task::TaskRef;
use crate::utils::errors::{Result, RuntimeError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

pub struct WorkStealingComponent {
    deques: Vec<Mutex<VecDeque<TaskRef>>>,
    next_push: AtomicUsize,
    next_victim: AtomicUsize,
    keep_local: bool,
}

impl WorkStealingComponent {
    pub fn new(keep_local: bool) -> Self {
        Self {
            deques: Vec::new(),
            next_push: AtomicUsize::new(0),
            next_victim: AtomicUsize::new(0),
            keep_local,
        }
    }

    pub(super) fn add_child(&mut self) {
        self.deques.push(Mutex::new(VecDeque::new()));
    }

    pub(super) fn remove_child(&mut self, pos: usize) -> Vec<TaskRef> {
        if pos >= self.deques.len() {
            return Vec::new();
        }
        self.deques.remove(pos).into_inner().into_iter().collect()
    }

    pub fn ntasks(&self) -> usize {
        self.deques.iter().map(|deque| deque.lock().len()).sum()
    }

    /// Tasks queued for each child
    pub fn lengths(&self) -> Vec<usize> {
        self.deques.iter().map(|deque| deque.lock().len()).collect()
    }

    pub fn drain(&self) -> Vec<TaskRef> {
        self.deques
            .iter()
            .flat_map(|deque| deque.lock().drain(..).collect::<Vec<_>>())
            .collect()
    }
}

impl SchedTree {
    pub(super) fn work_stealing_push(
        &self,
        inner: &TreeInner,
        component: &SchedComponent,
        ws: &WorkStealingComponent,
        task: TaskRef,
    ) -> Result<()> {
        let n = component.children.len().min(ws.deques.len());
        let runnable = |i: usize| self.can_execute_in(inner, component.children[i], &task);

        let local = if ws.keep_local {
            current_worker().and_then(|worker| {
                (0..n).find(|&i| inner.get(component.children[i]).workers.contains(worker))
            })
        } else {
            None
        };
        let target = match local.filter(|&i| runnable(i)) {
            Some(i) => Some(i),
            None => {
                let start = ws.next_push.fetch_add(1, Ordering::Relaxed);
                (0..n).map(|k| (start + k) % n).find(|&i| runnable(i))
            }
        };
        let Some(target) = target else {
            return Err(RuntimeError::NoDevice(task.id()));
        };

        trace!(task = %task.id(), child = target, "Queued on work-stealing deque");
        ws.deques[target].lock().push_back(task);
        self.wake_workers(inner.get(component.children[target]));
        Ok(())
    }

    pub(super) fn work_stealing_pull(
        &self,
        inner: &TreeInner,
        component: &SchedComponent,
        ws: &WorkStealingComponent,
        worker: WorkerId,
    ) -> Option<TaskRef> {
        let descr = self.env.worker(worker)?;
        let n = component.children.len().min(ws.deques.len());
        let own = (0..n).find(|&i| inner.get(component.children[i]).workers.contains(worker));

        if let Some(own) = own {
            let mut deque = ws.deques[own].lock();
            if let Some(pos) = deque.iter().position(|task| worker_may_execute_task(descr, task)) {
                trace!(worker = %worker, "Got task from local deque");
                return deque.remove(pos);
            }
        }

        let start = ws.next_victim.fetch_add(1, Ordering::Relaxed);
        for k in 0..n {
            let victim = (start + k) % n;
            if Some(victim) == own {
                continue;
            }
            let mut deque = ws.deques[victim].lock();
            if deque
                .back()
                .map_or(false, |task| worker_may_execute_task(descr, task))
            {
                trace!(worker = %worker, victim, "Stole task from another worker");
                return deque.pop_back();
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::sched::tree::tests::{cpu_task, env};
    use crate::sched::tree::{ComponentSpec, SchedTree};
    use crate::sched::worker::{set_current_worker, WorkerId, WorkerMask};
    use crate::task::TaskId;
    use std::sync::Arc;

    fn ws_tree(nworkers: usize, keep_local: bool) -> (SchedTree, crate::sched::tree::ComponentId) {
        let tree = SchedTree::new(env(nworkers, 0));
        let root = tree.create(ComponentSpec::WorkStealing { keep_local });
        for w in 0..nworkers {
            let leaf = tree.worker_component(WorkerId(w));
            tree.add_child(root, leaf);
        }
        tree.set_root(root);
        tree.set_ctx_workers(&(0..nworkers).map(WorkerId).collect::<WorkerMask>());
        (tree, root)
    }

    #[test]
    fn test_round_robin_push() {
        let (tree, _) = ws_tree(3, false);
        for _ in 0..6 {
            tree.push_task(cpu_task()).unwrap();
        }
        assert_eq!(tree.ntasks(), 6);
        for w in 0..3 {
            assert!(tree.pop_task(WorkerId(w)).is_some());
        }
    }

    #[test]
    fn test_steal_from_tail() {
        let (tree, _) = ws_tree(2, true);
        // Worker 1 pushes three tasks and keeps them
        set_current_worker(Some(WorkerId(1)));
        let tasks: Vec<_> = (0..3).map(|_| cpu_task()).collect();
        for task in &tasks {
            tree.push_task(Arc::clone(task)).unwrap();
        }
        set_current_worker(None);

        let stolen = tree.pop_task(WorkerId(0)).unwrap();
        assert_eq!(stolen.id(), tasks[2].id());
        assert_eq!(tree.ntasks(), 2);

        let own: Vec<TaskId> = std::iter::from_fn(|| tree.pop_task(WorkerId(1)))
            .map(|t| t.id())
            .collect();
        assert_eq!(own, vec![tasks[0].id(), tasks[1].id()]);
    }

    #[test]
    fn test_removed_child_returns_tasks() {
        let (tree, root) = ws_tree(2, false);
        tree.push_task(cpu_task()).unwrap();
        tree.push_task(cpu_task()).unwrap();
        let leaf = tree.worker_component(WorkerId(1));
        let orphans = tree.remove_child(root, leaf);
        assert_eq!(orphans.len(), 1);
        assert_eq!(tree.ntasks(), 1);
    }
}
