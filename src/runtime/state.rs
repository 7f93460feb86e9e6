// src/runtime/state.rs
//! State shared between the application thread and the workers

use crate::coherency::DataEngine;
use crate::deps::{release_task_data, ReadySink};
use crate::observability::PerfCounters;
use crate::sched::{SchedContexts, Topology, WorkerId, WorkerWaker};
use crate::task::{TaskRef, TaskStatus};
use crate::utils::config::RuntimeConfig;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace};

/// One sleeping slot per worker
///
/// The flag records a wake-up that arrived while the worker was busy, so a
/// push racing with the worker going idle is not lost.
#[derive(Debug)]
pub struct WorkerSleep {
    slots: Vec<(Mutex<bool>, Condvar)>,
}

impl WorkerSleep {
    pub fn new(nworkers: usize) -> Self {
        Self {
            slots: (0..nworkers).map(|_| (Mutex::new(false), Condvar::new())).collect(),
        }
    }

    /// Block `worker` until woken or `timeout` elapses
    pub fn sleep(&self, worker: WorkerId, timeout: Duration) {
        let Some((lock, cvar)) = self.slots.get(worker.index()) else {
            return;
        };
        let mut woken = lock.lock();
        if !*woken {
            cvar.wait_for(&mut woken, timeout);
        }
        *woken = false;
    }
}

impl WorkerWaker for WorkerSleep {
    fn wake_worker(&self, worker: WorkerId) {
        if let Some((lock, cvar)) = self.slots.get(worker.index()) {
            *lock.lock() = true;
            cvar.notify_one();
        }
    }

    fn wake_all(&self) {
        for (lock, cvar) in &self.slots {
            *lock.lock() = true;
            cvar.notify_one();
        }
    }
}

/// Task counts since start-up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub submitted: u64,
    pub executed: u64,
    /// Tasks terminated without running, e.g. when no worker could take them
    pub lost: u64,
}

pub(crate) struct RuntimeState {
    pub(crate) config: RuntimeConfig,
    pub(crate) topology: Arc<Topology>,
    pub(crate) data: Arc<DataEngine>,
    pub(crate) contexts: SchedContexts,
    pub(crate) counters: Arc<dyn PerfCounters>,
    pub(crate) sleep: Arc<WorkerSleep>,
    pub(crate) shutdown: AtomicBool,
    inflight: Mutex<usize>,
    all_done: Condvar,
    submitted: AtomicU64,
    executed: AtomicU64,
    lost: AtomicU64,
}

impl RuntimeState {
    pub(crate) fn new(
        config: RuntimeConfig,
        topology: Arc<Topology>,
        data: Arc<DataEngine>,
        contexts: SchedContexts,
        counters: Arc<dyn PerfCounters>,
        sleep: Arc<WorkerSleep>,
    ) -> Self {
        Self {
            config,
            topology,
            data,
            contexts,
            counters,
            sleep,
            shutdown: AtomicBool::new(false),
            inflight: Mutex::new(0),
            all_done: Condvar::new(),
            submitted: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        }
    }

    pub(crate) fn task_submitted(&self) {
        *self.inflight.lock() += 1;
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Release the task's data, run its callback and account for it
    pub(crate) fn terminate(&self, task: &TaskRef, executed: bool) {
        release_task_data(task, self);
        if let Some(callback) = task.take_callback() {
            callback();
        }
        if let Ok(ctx) = self.contexts.get(task.ctx()) {
            ctx.task_finished();
        }
        task.set_status(TaskStatus::Finished);
        if executed {
            self.executed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lost.fetch_add(1, Ordering::Relaxed);
        }

        let mut inflight = self.inflight.lock();
        *inflight = inflight.saturating_sub(1);
        if *inflight == 0 {
            self.all_done.notify_all();
        }
    }

    /// Block until every submitted task terminated
    pub(crate) fn wait_for_all(&self) {
        let mut inflight = self.inflight.lock();
        while *inflight > 0 {
            self.all_done.wait(&mut inflight);
        }
    }

    pub(crate) fn inflight(&self) -> usize {
        *self.inflight.lock()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn task_stats(&self) -> TaskStats {
        TaskStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }
}

impl ReadySink for RuntimeState {
    fn push_ready(&self, task: TaskRef) {
        task.set_status(TaskStatus::Ready);
        trace!(task = %task.id(), "Task ready");
        if let Err(err) = self.contexts.push_task(TaskRef::clone(&task)) {
            error!(task = %task.id(), name = task.name(), error = %err, "Task lost: no worker can run it");
            self.terminate(&task, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wake_before_sleep_is_kept() {
        let sleep = WorkerSleep::new(2);
        sleep.wake_worker(WorkerId(1));
        let start = Instant::now();
        sleep.sleep(WorkerId(1), Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_times_out() {
        let sleep = WorkerSleep::new(1);
        let start = Instant::now();
        sleep.sleep(WorkerId(0), Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_wake_all_reaches_sleeper() {
        let sleep = Arc::new(WorkerSleep::new(1));
        let sleeper = Arc::clone(&sleep);
        let start = Instant::now();
        let thread = thread::spawn(move || sleeper.sleep(WorkerId(0), Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        sleep.wake_all();
        thread.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
