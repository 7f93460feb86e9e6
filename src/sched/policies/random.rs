// src/sched/policies/random.rs
//! `random`: per-worker queues filled by a speed-weighted draw

use crate::sched::env::SchedEnv;
use crate::sched::policy::{worker_may_execute_task, SchedPolicy};
use crate::sched::queue::TaskQueue;
use crate::sched::tree::RandomComponent;
use crate::sched::worker::{WorkerId, WorkerMask};
use crate::task::TaskRef;
use crate::utils::errors::{Result, RuntimeError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{trace, warn};

pub struct RandomPolicy {
    env: Arc<SchedEnv>,
    draw: RandomComponent,
    queues: Vec<Mutex<TaskQueue>>,
    workers: RwLock<WorkerMask>,
}

impl RandomPolicy {
    pub fn new(env: Arc<SchedEnv>) -> Self {
        let now = env.now();
        let queues = (0..env.topology.len())
            .map(|_| Mutex::new(TaskQueue::new(now)))
            .collect();
        Self {
            draw: RandomComponent::new(env.config.seed),
            env,
            queues,
            workers: RwLock::new(WorkerMask::new()),
        }
    }
}

impl SchedPolicy for RandomPolicy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn add_workers(&self, workers: &[WorkerId]) {
        let mut mask = self.workers.write();
        for worker in workers {
            mask.insert(*worker);
        }
    }

    fn remove_workers(&self, workers: &[WorkerId]) {
        {
            let mut mask = self.workers.write();
            for worker in workers {
                mask.remove(*worker);
            }
        }
        for worker in workers {
            let Some(queue) = self.queues.get(worker.index()) else {
                continue;
            };
            let orphans = queue.lock().drain();
            for task in orphans {
                if let Err(err) = self.push_task(Arc::clone(&task)) {
                    warn!(task = %task.id(), error = %err, "Task lost with its worker");
                }
            }
        }
    }

    fn push_task(&self, task: TaskRef) -> Result<()> {
        let candidates: Vec<_> = self
            .workers
            .read()
            .iter()
            .filter_map(|worker| self.env.worker(worker))
            .filter(|descr| worker_may_execute_task(descr, &task))
            .cloned()
            .collect();
        let weights: Vec<f64> = candidates.iter().map(|d| d.relative_speedup()).collect();
        let chosen = self
            .draw
            .draw(&weights)
            .map(|i| candidates[i].id)
            .ok_or(RuntimeError::NoDevice(task.id()))?;

        trace!(task = %task.id(), worker = %chosen, "Random placement");
        task.update_sched_info(|info| info.worker = Some(chosen));
        self.queues[chosen.index()].lock().push_back(task);
        self.env.waker.wake_worker(chosen);
        Ok(())
    }

    fn pop_task(&self, worker: WorkerId) -> Option<TaskRef> {
        self.queues.get(worker.index())?.lock().pop_front()
    }

    fn pop_every_task(&self) -> Vec<TaskRef> {
        self.queues
            .iter()
            .flat_map(|queue| queue.lock().drain())
            .collect()
    }

    fn ntasks(&self) -> usize {
        self.queues.iter().map(|queue| queue.lock().len()).sum()
    }
}
