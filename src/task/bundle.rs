// src/task/bundle.rs
//! Task bundles
//!
//! A bundle groups tasks the application wants scheduled together. A
//! performance-model policy evaluates a bundled task by the cost of the
//! whole bundle, then removes it from the bundle once it has been placed.

use crate::memory::NodeId;
use crate::perfmodel::{Estimator, LengthEstimate};
use crate::sched::WorkerDescr;
use crate::task::{sort_buffers, BufferDescr, TaskRef};
use crate::utils::errors::{Result, RuntimeError};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct BundleInner {
    tasks: Vec<TaskRef>,
    closed: bool,
}

/// A set of tasks evaluated together
#[derive(Debug, Default)]
pub struct TaskBundle {
    inner: Mutex<BundleInner>,
}

impl TaskBundle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a task that has not been submitted yet
    pub fn insert(self: &Arc<Self>, task: &TaskRef) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(RuntimeError::BundleClosed);
        }
        if task.is_submitted() {
            return Err(RuntimeError::AlreadySubmitted(task.id()));
        }
        task.set_bundle(Some(Arc::downgrade(self)));
        inner.tasks.push(Arc::clone(task));
        Ok(())
    }

    /// Remove a task, typically once the scheduler has placed it
    pub fn remove(&self, task: &TaskRef) -> Result<()> {
        let mut inner = self.inner.lock();
        let position = inner
            .tasks
            .iter()
            .position(|t| t.id() == task.id())
            .ok_or(RuntimeError::NotInBundle(task.id()))?;
        inner.tasks.remove(position);
        task.set_bundle(None);
        Ok(())
    }

    /// No more tasks may be inserted
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tasks(&self) -> Vec<TaskRef> {
        self.inner.lock().tasks.clone()
    }

    /// Sum of the expected lengths of the bundled tasks on `worker`
    ///
    /// Uncalibrated as soon as one task is uncalibrated.
    pub fn expected_length(
        &self,
        estimator: &dyn Estimator,
        worker: &WorkerDescr,
        implementation: usize,
    ) -> LengthEstimate {
        let mut total = 0.0;
        let mut any_model = false;
        for task in self.tasks() {
            match estimator.expected_length(&task, worker, implementation) {
                LengthEstimate::Calibrated(length) => {
                    total += length;
                    any_model = true;
                }
                LengthEstimate::Uncalibrated => return LengthEstimate::Uncalibrated,
                LengthEstimate::NoModel => {}
            }
        }
        if any_model {
            LengthEstimate::Calibrated(total)
        } else {
            LengthEstimate::NoModel
        }
    }

    /// Sum of the expected energy of the bundled tasks on `worker`
    pub fn expected_power(
        &self,
        estimator: &dyn Estimator,
        worker: &WorkerDescr,
        implementation: usize,
    ) -> Option<f64> {
        let mut total = None;
        for task in self.tasks() {
            if let Some(power) = estimator.expected_power(&task, worker, implementation) {
                *total.get_or_insert(0.0) += power;
            }
        }
        total
    }

    /// Expected time to bring every input of the bundle to `node`, counting
    /// each handle once
    pub fn expected_data_transfer_time(&self, estimator: &dyn Estimator, node: NodeId) -> f64 {
        let buffers: Vec<BufferDescr> = self
            .tasks()
            .iter()
            .flat_map(|task| task.ordered_buffers().to_vec())
            .collect();
        sort_buffers(&buffers)
            .iter()
            .filter(|buffer| buffer.mode.reads())
            .map(|buffer| estimator.expected_handle_transfer_time(&buffer.handle, node))
            .sum()
    }
}
