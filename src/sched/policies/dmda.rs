// src/sched/policies/dmda.rs
//! Deque-model policies: `heft`, `dm`, `dmda`, `dmdas`, `dmdar`
//!
//! Every worker owns a queue whose expected drain time is tracked. A task
//! goes to the worker minimizing
//!
//! ```text
//! fitness = alpha * (exp_end - best_exp_end)
//!         + beta  * transfer
//!         + gamma * energy
//!         + gamma * idle_power * (exp_end - max_exp_end)   when later than every queue
//! ```
//!
//! unless some capable worker has no calibrated model for it, in which case
//! the least loaded worker gets it so calibration completes quickly.

use crate::perfmodel::LengthEstimate;
use crate::sched::env::SchedEnv;
use crate::sched::policy::{count_non_ready_buffers, implementations_for, SchedPolicy};
use crate::sched::queue::{QueueEstimates, TaskQueue};
use crate::sched::worker::{WorkerId, WorkerMask};
use crate::task::TaskRef;
use crate::utils::errors::{Result, RuntimeError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Member of the deque-model family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmVariant {
    /// Data aware, handles task bundles
    Heft,
    /// Expected end only
    Dm,
    /// Data aware
    Dmda,
    /// Data aware, priority sorted queues, ready-first pops
    Dmdas,
    /// Data aware, ready-first pops
    Dmdar,
}

impl DmVariant {
    pub fn name(self) -> &'static str {
        match self {
            DmVariant::Heft => "heft",
            DmVariant::Dm => "dm",
            DmVariant::Dmda => "dmda",
            DmVariant::Dmdas => "dmdas",
            DmVariant::Dmdar => "dmdar",
        }
    }

    fn data_aware(self) -> bool {
        !matches!(self, DmVariant::Dm)
    }

    fn sorted(self) -> bool {
        matches!(self, DmVariant::Dmdas)
    }

    fn ready_first(self) -> bool {
        matches!(self, DmVariant::Dmdas | DmVariant::Dmdar)
    }
}

/// Cost of running a task on one worker with one implementation
#[derive(Debug, Clone, Copy)]
struct Prediction {
    worker: WorkerId,
    implementation: usize,
    length: LengthEstimate,
    exp_end: f64,
    transfer: f64,
    power: f64,
}

pub struct DequeModelPolicy {
    env: Arc<SchedEnv>,
    variant: DmVariant,
    queues: Vec<Mutex<TaskQueue>>,
    workers: RwLock<WorkerMask>,
}

impl DequeModelPolicy {
    pub fn new(env: Arc<SchedEnv>, variant: DmVariant) -> Self {
        let now = env.now();
        let queues = (0..env.topology.len())
            .map(|_| Mutex::new(TaskQueue::new(now)))
            .collect();
        Self {
            env,
            variant,
            queues,
            workers: RwLock::new(WorkerMask::new()),
        }
    }

    /// Bookkeeping of one worker's queue
    pub fn queue_estimates(&self, worker: WorkerId) -> Option<QueueEstimates> {
        self.queues.get(worker.index()).map(|queue| queue.lock().estimates())
    }

    /// Choose a worker and the prediction it was chosen with
    fn select(&self, task: &TaskRef) -> Result<Prediction> {
        let env = &self.env;
        let now = env.now();
        let bundle = if self.variant == DmVariant::Heft {
            task.bundle()
        } else {
            None
        };

        let mut predictions: Vec<Prediction> = Vec::new();
        let mut best_exp_end = f64::INFINITY;
        let mut max_exp_end = 0.0_f64;
        let mut ntasks_best: Option<(Prediction, f64)> = None;
        let mut calibrating = false;
        let mut unknown = false;

        for worker in self.workers.read().iter() {
            let Some(descr) = env.worker(worker) else {
                continue;
            };
            let implementations = implementations_for(descr, task);
            if implementations.is_empty() {
                continue;
            }
            let (exp_start, exp_len, ntasks) = {
                let mut queue = self.queues[worker.index()].lock();
                queue.refresh(now);
                (queue.exp_start, queue.exp_len, queue.len())
            };
            max_exp_end = max_exp_end.max(exp_start + exp_len);

            for implementation in implementations {
                let (length, transfer, power) = match &bundle {
                    Some(bundle) => (
                        bundle.expected_length(env.estimator.as_ref(), descr, implementation),
                        bundle.expected_data_transfer_time(env.estimator.as_ref(), descr.memory_node),
                        bundle.expected_power(env.estimator.as_ref(), descr, implementation),
                    ),
                    None => (
                        env.estimator.expected_length(task, descr, implementation),
                        env.estimator.expected_transfer_time(task, descr.memory_node),
                        env.estimator.expected_power(task, descr, implementation),
                    ),
                };
                let transfer = if self.variant.data_aware() { transfer } else { 0.0 };
                let uncalibrated = length == LengthEstimate::Uncalibrated;
                let prediction = Prediction {
                    worker,
                    implementation,
                    length,
                    exp_end: exp_start + exp_len + length.value().unwrap_or(0.0),
                    transfer,
                    power: power.unwrap_or(0.0),
                };

                // Least loaded worker, preferring ones still calibrating
                let ntasks_end = ntasks as f64 / descr.relative_speedup();
                let better = match &ntasks_best {
                    None => true,
                    Some((_, best_end)) => {
                        (!calibrating && ntasks_end < *best_end)
                            || (!calibrating && uncalibrated)
                            || (calibrating && uncalibrated && ntasks_end < *best_end)
                    }
                };
                if better {
                    ntasks_best = Some((prediction, ntasks_end));
                }
                if uncalibrated {
                    calibrating = true;
                }
                if !length.is_calibrated() {
                    unknown = true;
                }
                if unknown {
                    continue;
                }
                best_exp_end = best_exp_end.min(prediction.exp_end);
                predictions.push(prediction);
            }
        }

        let Some((forced, _)) = ntasks_best else {
            return Err(RuntimeError::NoDevice(task.id()));
        };
        if unknown {
            debug!(task = %task.id(), worker = %forced.worker, calibrating, "Greedy placement without a model");
            return Ok(forced);
        }

        let config = &env.config;
        let (beta, gamma, idle_power) = if self.variant.data_aware() {
            (config.beta, config.gamma, config.idle_power)
        } else {
            (0.0, 0.0, 0.0)
        };
        let mut best: Option<(f64, Prediction)> = None;
        for prediction in predictions {
            let mut fitness = config.alpha * (prediction.exp_end - best_exp_end)
                + beta * prediction.transfer
                + gamma * prediction.power;
            if prediction.exp_end > max_exp_end {
                // Every other worker idles meanwhile
                fitness += gamma * idle_power * (prediction.exp_end - max_exp_end) / 1e6;
            }
            if best.map_or(true, |(best_fitness, _)| fitness < best_fitness) {
                best = Some((fitness, prediction));
            }
        }
        best.map(|(_, prediction)| prediction)
            .ok_or(RuntimeError::NoDevice(task.id()))
    }
}

impl SchedPolicy for DequeModelPolicy {
    fn name(&self) -> &'static str {
        self.variant.name()
    }

    fn add_workers(&self, workers: &[WorkerId]) {
        let now = self.env.now();
        let mut mask = self.workers.write();
        for worker in workers {
            if let Some(queue) = self.queues.get(worker.index()) {
                queue.lock().refresh(now);
                mask.insert(*worker);
            }
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
        let best = self.select(&task)?;
        let descr = self
            .env
            .worker(best.worker)
            .ok_or(RuntimeError::UnknownWorker(best.worker))?;

        if let Some(bundle) = task.bundle() {
            // Placed on its own from now on
            if let Err(err) = bundle.remove(&task) {
                trace!(task = %task.id(), error = %err, "Stale bundle link");
                task.set_bundle(None);
            }
        }
        task.update_sched_info(|info| {
            info.implementation = best.implementation;
            info.predicted = best.length.value();
            info.predicted_transfer = Some(best.transfer);
            info.worker = Some(best.worker);
        });
        debug!(
            task = %task.id(),
            policy = self.variant.name(),
            worker = %best.worker,
            predicted = ?best.length.value(),
            "Task placed"
        );

        self.env.prefetch(&task, descr.memory_node);
        {
            let mut queue = self.queues[best.worker.index()].lock();
            queue.refresh(self.env.now());
            if self.variant.sorted() {
                queue.push_sorted(task);
            } else {
                queue.push_back(task);
            }
        }
        self.env.waker.wake_worker(best.worker);
        Ok(())
    }

    fn pop_task(&self, worker: WorkerId) -> Option<TaskRef> {
        let descr = self.env.worker(worker)?;
        let now = self.env.now();
        let mut queue = self.queues.get(worker.index())?.lock();
        let task = if self.variant.ready_first() {
            queue.pop_first_ready(|task| count_non_ready_buffers(task, descr.memory_node))
        } else {
            queue.pop_front()
        }?;
        if let Some(predicted) = task.predicted() {
            queue.exp_start = now + predicted;
            queue.exp_end = queue.exp_start + queue.exp_len;
        }
        Some(task)
    }

    fn post_exec_hook(&self, task: &TaskRef, worker: WorkerId) {
        if task.predicted().is_none() {
            return;
        }
        let now = self.env.now();
        if let Some(queue) = self.queues.get(worker.index()) {
            let mut queue = queue.lock();
            queue.exp_start = now;
            queue.exp_end = queue.exp_start + queue.exp_len;
        }
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
