// src/sched/policies/central.rs
//! `eager` and `prio`: one queue shared by every worker of the context

use crate::sched::env::SchedEnv;
use crate::sched::policy::{worker_may_execute_task, SchedPolicy};
use crate::sched::queue::TaskQueue;
use crate::sched::worker::{WorkerId, WorkerMask};
use crate::task::TaskRef;
use crate::utils::errors::{Result, RuntimeError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::trace;

pub struct CentralQueuePolicy {
    name: &'static str,
    env: Arc<SchedEnv>,
    sorted: bool,
    queue: Mutex<TaskQueue>,
    workers: RwLock<WorkerMask>,
}

impl CentralQueuePolicy {
    /// Arrival order
    pub fn eager(env: Arc<SchedEnv>) -> Self {
        Self::new("eager", env, false)
    }

    /// Priority order, ties by arrival
    pub fn prio(env: Arc<SchedEnv>) -> Self {
        Self::new("prio", env, true)
    }

    fn new(name: &'static str, env: Arc<SchedEnv>, sorted: bool) -> Self {
        let now = env.now();
        Self {
            name,
            env,
            sorted,
            queue: Mutex::new(TaskQueue::new(now)),
            workers: RwLock::new(WorkerMask::new()),
        }
    }
}

impl SchedPolicy for CentralQueuePolicy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn add_workers(&self, workers: &[WorkerId]) {
        let mut mask = self.workers.write();
        for worker in workers {
            mask.insert(*worker);
        }
    }

    fn remove_workers(&self, workers: &[WorkerId]) {
        let mut mask = self.workers.write();
        for worker in workers {
            mask.remove(*worker);
        }
    }

    fn push_task(&self, task: TaskRef) -> Result<()> {
        let workers = self.workers.read().clone();
        let runnable = workers
            .iter()
            .filter_map(|worker| self.env.worker(worker))
            .any(|descr| worker_may_execute_task(descr, &task));
        if !runnable {
            return Err(RuntimeError::NoDevice(task.id()));
        }

        trace!(task = %task.id(), policy = self.name, "Queued on central queue");
        {
            let mut queue = self.queue.lock();
            if self.sorted {
                queue.push_sorted(task);
            } else {
                queue.push_back(task);
            }
        }
        for worker in workers.iter() {
            self.env.waker.wake_worker(worker);
        }
        Ok(())
    }

    fn pop_task(&self, worker: WorkerId) -> Option<TaskRef> {
        let descr = self.env.worker(worker)?;
        self.queue
            .lock()
            .pop_first_matching(|task| worker_may_execute_task(descr, task))
    }

    fn pop_every_task(&self) -> Vec<TaskRef> {
        self.queue.lock().drain()
    }

    fn ntasks(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::tree::tests::{cpu_task, cuda_task, env};
    use crate::task::Task;

    #[test]
    fn test_eager_is_fifo() {
        let policy = CentralQueuePolicy::eager(env(2, 0));
        policy.add_workers(&[WorkerId(0), WorkerId(1)]);
        let (a, b) = (cpu_task(), cpu_task());
        policy.push_task(Arc::clone(&a)).unwrap();
        policy.push_task(Arc::clone(&b)).unwrap();
        assert_eq!(policy.pop_task(WorkerId(1)).unwrap().id(), a.id());
        assert_eq!(policy.pop_task(WorkerId(0)).unwrap().id(), b.id());
    }

    #[test]
    fn test_prio_order() {
        let policy = CentralQueuePolicy::prio(env(1, 0));
        policy.add_workers(&[WorkerId(0)]);
        let low = Task::control().priority(1).build();
        let high = Task::control().priority(9).build();
        policy.push_task(low).unwrap();
        policy.push_task(Arc::clone(&high)).unwrap();
        assert_eq!(policy.pop_task(WorkerId(0)).unwrap().id(), high.id());
    }

    #[test]
    fn test_no_device() {
        let policy = CentralQueuePolicy::eager(env(2, 0));
        policy.add_workers(&[WorkerId(0), WorkerId(1)]);
        assert!(matches!(
            policy.push_task(cuda_task()),
            Err(RuntimeError::NoDevice(_))
        ));
        assert_eq!(policy.ntasks(), 0);
    }
}
