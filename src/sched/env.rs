// src/sched/env.rs
//! Services shared by every scheduling policy

use crate::memory::NodeId;
use crate::observability::{NoopCounters, PerfCounters};
use crate::perfmodel::Estimator;
use crate::sched::worker::{Topology, WorkerDescr, WorkerId};
use crate::task::TaskRef;
use crate::utils::config::SchedConfig;
use crate::utils::Clock;
use std::sync::Arc;

/// Starts moving a task's inputs towards the node it will run on
pub trait Prefetcher: Send + Sync {
    fn prefetch_task_input(&self, task: &TaskRef, node: NodeId);
}

/// Wakes workers sleeping on an empty queue
pub trait WorkerWaker: Send + Sync {
    fn wake_worker(&self, worker: WorkerId);

    fn wake_all(&self);
}

/// Waker for policies driven without worker threads
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWaker;

impl WorkerWaker for NoopWaker {
    fn wake_worker(&self, _worker: WorkerId) {}

    fn wake_all(&self) {}
}

/// Everything a policy reads but does not own
pub struct SchedEnv {
    pub topology: Arc<Topology>,
    pub clock: Clock,
    pub estimator: Arc<dyn Estimator>,
    pub config: SchedConfig,
    /// Queue length above which queue components stop accepting tasks
    pub ntasks_threshold: usize,
    pub prefetcher: Option<Arc<dyn Prefetcher>>,
    pub waker: Arc<dyn WorkerWaker>,
    pub counters: Arc<dyn PerfCounters>,
}

impl SchedEnv {
    pub fn new(topology: Arc<Topology>, estimator: Arc<dyn Estimator>, config: SchedConfig) -> Self {
        let ntasks_threshold = config.ntasks_threshold.unwrap_or(30);
        Self {
            topology,
            clock: Clock::monotonic(),
            estimator,
            config,
            ntasks_threshold,
            prefetcher: None,
            waker: Arc::new(NoopWaker),
            counters: Arc::new(NoopCounters),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prefetcher(mut self, prefetcher: Arc<dyn Prefetcher>) -> Self {
        self.prefetcher = Some(prefetcher);
        self
    }

    pub fn with_waker(mut self, waker: Arc<dyn WorkerWaker>) -> Self {
        self.waker = waker;
        self
    }

    pub fn with_counters(mut self, counters: Arc<dyn PerfCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_ntasks_threshold(mut self, threshold: usize) -> Self {
        self.ntasks_threshold = threshold;
        self
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerDescr> {
        self.topology.worker(id)
    }

    /// Prefetch the inputs of `task` to `node` when prefetching is enabled
    pub fn prefetch(&self, task: &TaskRef, node: NodeId) {
        if !self.config.prefetch {
            return;
        }
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.prefetch_task_input(task, node);
        }
    }
}
