// src/sched/tree/select.rs
//! Components routing a task to one child without storing it

use crate::perfmodel::LengthEstimate;
use crate::sched::policy::{implementations_for, worker_may_execute_task};
use crate::sched::tree::{ComponentId, SchedComponent, SchedTree, TreeInner};
use crate::task::Task;
use crate::utils::errors::{Result, RuntimeError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Picks a child at random, weighted by the speed of its workers
pub struct RandomComponent {
    rng: Mutex<StdRng>,
}

impl RandomComponent {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// Index drawn with probability proportional to `weights`
    pub fn draw(&self, weights: &[f64]) -> Option<usize> {
        let total: f64 = weights.iter().sum();
        if weights.is_empty() || total <= 0.0 {
            return None;
        }
        let mut point = self.rng.lock().gen_range(0.0..total);
        for (i, weight) in weights.iter().enumerate() {
            if point < *weight {
                return Some(i);
            }
            point -= weight;
        }
        Some(weights.len() - 1)
    }
}

/// Children of a perfmodel selector
#[derive(Debug, Clone, Copy)]
pub struct PerfmodelBranches {
    /// Tasks whose model still needs samples
    pub calibrator: ComponentId,
    /// Tasks without a model
    pub no_model: ComponentId,
    /// Tasks with a calibrated model everywhere
    pub perfmodel: ComponentId,
}

impl SchedTree {
    pub(super) fn random_child(
        &self,
        inner: &TreeInner,
        component: &SchedComponent,
        random: &RandomComponent,
        task: &Task,
    ) -> Result<ComponentId> {
        let candidates: Vec<ComponentId> = component
            .children
            .iter()
            .copied()
            .filter(|child| self.can_execute_in(inner, *child, task))
            .collect();
        let weights: Vec<f64> = candidates
            .iter()
            .map(|child| {
                inner
                    .get(*child)
                    .workers_in_ctx
                    .iter()
                    .filter_map(|worker| self.env.worker(worker))
                    .filter(|descr| worker_may_execute_task(descr, task))
                    .map(|descr| descr.relative_speedup())
                    .sum()
            })
            .collect();
        random
            .draw(&weights)
            .map(|i| candidates[i])
            .ok_or(RuntimeError::NoDevice(task.id()))
    }

    /// First child with room, else the first able to run the task
    pub(super) fn eager_child(
        &self,
        inner: &TreeInner,
        component: &SchedComponent,
        task: &Task,
    ) -> Result<ComponentId> {
        let mut runnable = component
            .children
            .iter()
            .copied()
            .filter(|child| self.can_execute_in(inner, *child, task));
        let first = runnable.next().ok_or(RuntimeError::NoDevice(task.id()))?;
        if self.has_room(inner, first) {
            return Ok(first);
        }
        Ok(runnable
            .find(|child| self.has_room(inner, *child))
            .unwrap_or(first))
    }

    /// Calibration first, then tasks lacking a model, then modelled tasks
    pub(super) fn perfmodel_branch(
        &self,
        component: &SchedComponent,
        branches: &PerfmodelBranches,
        task: &Task,
    ) -> ComponentId {
        let mut no_model = false;
        for descr in component
            .workers_in_ctx
            .iter()
            .filter_map(|worker| self.env.worker(worker))
        {
            for implementation in implementations_for(descr, task) {
                match self.env.estimator.expected_length(task, descr, implementation) {
                    LengthEstimate::Uncalibrated => return branches.calibrator,
                    LengthEstimate::NoModel => no_model = true,
                    LengthEstimate::Calibrated(_) => {}
                }
            }
        }
        if no_model {
            branches.no_model
        } else {
            branches.perfmodel
        }
    }

    /// Pick the fastest implementation, evaluated on the first worker of
    /// the context able to run it, and route towards that worker
    pub(super) fn best_implementation_child(
        &self,
        inner: &TreeInner,
        component: &SchedComponent,
        task: &Task,
    ) -> Result<ComponentId> {
        let nimpls = task
            .codelet()
            .map_or(1, |codelet| codelet.implementations.len());
        let workers: Vec<_> = component
            .workers_in_ctx
            .iter()
            .filter_map(|worker| self.env.worker(worker))
            .collect();

        // (implementation, length, worker)
        let mut best: Option<(usize, Option<f64>, usize)> = None;
        'impls: for implementation in 0..nimpls {
            let Some(pos) = workers
                .iter()
                .position(|descr| implementations_for(descr, task).contains(&implementation))
            else {
                continue;
            };
            match self.env.estimator.expected_length(task, workers[pos], implementation) {
                LengthEstimate::Uncalibrated => {
                    best = Some((implementation, None, pos));
                    break 'impls;
                }
                LengthEstimate::NoModel => {
                    if best.is_none() {
                        best = Some((implementation, None, pos));
                    }
                }
                LengthEstimate::Calibrated(length) => {
                    if best.map_or(true, |(_, best_len, _)| best_len.map_or(true, |l| length < l)) {
                        best = Some((implementation, Some(length), pos));
                    }
                }
            }
        }
        let (implementation, length, pos) = best.ok_or(RuntimeError::NoDevice(task.id()))?;
        let descr = workers[pos];
        let transfer = self
            .env
            .estimator
            .expected_transfer_time(task, descr.memory_node);
        task.update_sched_info(|info| {
            info.implementation = implementation;
            info.predicted = length;
            info.predicted_transfer = Some(transfer);
        });
        debug!(task = %task.id(), implementation, worker = %descr.id, "Best implementation chosen");

        component
            .children
            .iter()
            .copied()
            .find(|child| inner.get(*child).workers_in_ctx.contains(descr.id))
            .or_else(|| {
                component
                    .children
                    .iter()
                    .copied()
                    .find(|child| self.can_execute_in(inner, *child, task))
            })
            .ok_or(RuntimeError::NoDevice(task.id()))
    }
}
