// src/sched/tree/heft.rs
//! Heterogeneous earliest-finish-time component
//!
//! Keeps pushed tasks in a local priority queue and hands them down, one at
//! a time, to the child with the best fitness among those with room. Pumping
//! resumes whenever a queue below reports room again.

use crate::perfmodel::LengthEstimate;
use crate::sched::policy::{implementations_for, worker_may_execute_task};
use crate::sched::queue::TaskQueue;
use crate::sched::tree::{ComponentId, ComponentKind, SchedComponent, SchedTree, TreeInner};
use crate::task::{Task, TaskRef};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};

pub struct HeftComponent {
    pending: Mutex<TaskQueue>,
}

impl HeftComponent {
    pub fn new(now: f64) -> Self {
        Self {
            pending: Mutex::new(TaskQueue::new(now)),
        }
    }

    pub fn push(&self, task: TaskRef) {
        self.pending.lock().push_sorted(task);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn drain(&self) -> Vec<TaskRef> {
        self.pending.lock().drain()
    }
}

/// Where a task goes and what it is expected to cost there
struct Placement {
    child: ComponentId,
    implementation: usize,
    length: Option<f64>,
    transfer: f64,
}

enum Decision {
    Place(Placement),
    /// Every capable child is full
    Wait,
    /// No child can run the task any more
    Lost,
}

struct Candidate {
    child: ComponentId,
    implementation: usize,
    length: Option<f64>,
    exp_end: f64,
    transfer: f64,
    power: f64,
    has_room: bool,
}

impl SchedTree {
    /// Move pending tasks down while some child has room
    pub(super) fn heft_pump(&self, inner: &TreeInner, id: ComponentId) {
        let component = inner.get(id);
        let ComponentKind::Heft(heft) = &component.kind else {
            return;
        };
        loop {
            let (task, placement) = {
                let mut pending = heft.pending.lock();
                let Some(task) = pending.front().cloned() else {
                    return;
                };
                match self.heft_decide(inner, component, &task) {
                    Decision::Wait => return,
                    Decision::Lost => {
                        pending.remove(task.id());
                        error!(task = %task.id(), "No child can execute the task any more");
                        continue;
                    }
                    Decision::Place(placement) => {
                        pending.remove(task.id());
                        (task, placement)
                    }
                }
            };
            task.update_sched_info(|info| {
                info.implementation = placement.implementation;
                info.predicted = placement.length;
                info.predicted_transfer = Some(placement.transfer);
            });
            debug!(task = %task.id(), child = %placement.child, "HEFT placement");
            if let Err(err) = self.push_to(inner, placement.child, Arc::clone(&task)) {
                error!(task = %task.id(), error = %err, "Child refused a placed task");
            }
        }
    }

    fn heft_decide(&self, inner: &TreeInner, component: &SchedComponent, task: &Task) -> Decision {
        let now = self.env.now();
        let candidates: Vec<Candidate> = component
            .children
            .iter()
            .filter_map(|child| self.heft_candidate(inner, *child, task, now))
            .collect();
        if candidates.is_empty() {
            return Decision::Lost;
        }

        let best_exp_end = candidates
            .iter()
            .map(|c| c.exp_end)
            .fold(f64::INFINITY, f64::min);
        let max_exp_end = component
            .children
            .iter()
            .map(|child| self.estimated_end_in(inner, *child))
            .fold(now, f64::max);

        let config = &self.env.config;
        let mut best: Option<(f64, &Candidate)> = None;
        for candidate in candidates.iter().filter(|c| c.has_room) {
            let mut fitness = config.alpha * (candidate.exp_end - best_exp_end)
                + config.beta * candidate.transfer
                + config.gamma * candidate.power;
            if candidate.exp_end > max_exp_end {
                fitness += config.gamma * config.idle_power * (candidate.exp_end - max_exp_end) / 1e6;
            }
            if best.map_or(true, |(best_fitness, _)| fitness < best_fitness) {
                best = Some((fitness, candidate));
            }
        }
        match best {
            Some((_, candidate)) => Decision::Place(Placement {
                child: candidate.child,
                implementation: candidate.implementation,
                length: candidate.length,
                transfer: candidate.transfer,
            }),
            None => Decision::Wait,
        }
    }

    /// Evaluate `task` on the first worker of `child` able to run it
    fn heft_candidate(
        &self,
        inner: &TreeInner,
        child: ComponentId,
        task: &Task,
        now: f64,
    ) -> Option<Candidate> {
        let descr = inner
            .get(child)
            .workers_in_ctx
            .iter()
            .filter_map(|worker| self.env.worker(worker))
            .find(|descr| worker_may_execute_task(descr, task))?;

        // Unmodelled and uncalibrated variants count as free
        let (implementation, length) = implementations_for(descr, task)
            .into_iter()
            .map(|implementation| {
                let estimate = self.env.estimator.expected_length(task, descr, implementation);
                (implementation, estimate)
            })
            .min_by(|(_, a), (_, b)| {
                let a = a.value().unwrap_or(0.0);
                let b = b.value().unwrap_or(0.0);
                a.total_cmp(&b)
            })?;
        let length = match length {
            LengthEstimate::Calibrated(length) => Some(length),
            _ => None,
        };
        let power = self
            .env
            .estimator
            .expected_power(task, descr, implementation)
            .unwrap_or(0.0);

        Some(Candidate {
            child,
            implementation,
            length,
            exp_end: self.estimated_end_in(inner, child).max(now) + length.unwrap_or(0.0),
            transfer: self
                .env
                .estimator
                .expected_transfer_time(task, descr.memory_node),
            power,
            has_room: self.has_room(inner, child),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::perfmodel::FixedModel;
    use crate::sched::tree::tests::env;
    use crate::sched::tree::{ComponentSpec, SchedTree};
    use crate::sched::worker::{ArchKind, WorkerId, WorkerMask};
    use crate::task::{Codelet, Task, TaskRef};
    use std::sync::Arc;

    fn heft_tree(nworkers: usize) -> SchedTree {
        let tree = SchedTree::new(env(nworkers, 0));
        let heft = tree.create(ComponentSpec::Heft);
        for w in 0..nworkers {
            let queue = tree.create(ComponentSpec::Prio { bounded: true });
            tree.add_child(heft, queue);
            let leaf = tree.worker_component(WorkerId(w));
            tree.add_child(queue, leaf);
        }
        tree.set_root(heft);
        tree.set_ctx_workers(&(0..nworkers).map(WorkerId).collect::<WorkerMask>());
        tree
    }

    fn modelled(length: f64) -> TaskRef {
        let codelet = Codelet::new("kernel", 0)
            .with_implementation(ArchKind::Cpu, |_| {})
            .with_model(Arc::new(FixedModel::new().with_length(ArchKind::Cpu, length)));
        Task::builder(Arc::new(codelet)).build()
    }

    #[test]
    fn test_balances_by_expected_end() {
        let tree = heft_tree(2);
        let (a, b) = (modelled(10.0), modelled(10.0));
        tree.push_task(Arc::clone(&a)).unwrap();
        tree.push_task(Arc::clone(&b)).unwrap();

        assert_eq!(a.predicted(), Some(10.0));
        assert_eq!(tree.pop_task(WorkerId(0)).unwrap().id(), a.id());
        assert_eq!(tree.pop_task(WorkerId(1)).unwrap().id(), b.id());
    }

    #[test]
    fn test_waits_for_room_then_resumes() {
        // Queue threshold is two tasks per worker
        let tree = heft_tree(1);
        let tasks: Vec<_> = (0..4).map(|_| modelled(1.0)).collect();
        for task in &tasks {
            tree.push_task(Arc::clone(task)).unwrap();
        }
        assert_eq!(tree.ntasks(), 4);

        let order: Vec<_> = std::iter::from_fn(|| tree.pop_task(WorkerId(0)))
            .map(|t| t.id())
            .collect();
        let expected: Vec<_> = tasks.iter().map(|t| t.id()).collect();
        assert_eq!(order, expected);
    }
}
