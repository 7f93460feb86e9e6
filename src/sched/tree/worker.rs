// src/sched/tree/worker.rs
//! Worker leaves

use crate::sched::queue::TaskQueue;
use crate::sched::worker::WorkerId;
use crate::task::{Task, TaskRef};
use parking_lot::Mutex;

/// Leaf standing for one worker, with the tasks already assigned to it
pub struct WorkerComponent {
    worker: WorkerId,
    queue: Mutex<TaskQueue>,
}

impl WorkerComponent {
    pub fn new(worker: WorkerId, now: f64) -> Self {
        Self {
            worker,
            queue: Mutex::new(TaskQueue::new(now)),
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn push(&self, task: TaskRef) {
        self.queue.lock().push_back(task);
    }

    pub fn pop(&self) -> Option<TaskRef> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn drain(&self) -> Vec<TaskRef> {
        self.queue.lock().drain()
    }

    /// The running task is expected to end `predicted` from now
    pub fn task_started(&self, task: &Task, now: f64) {
        let mut queue = self.queue.lock();
        queue.exp_start = now + task.predicted().unwrap_or(0.0);
        queue.refresh(now);
    }

    pub fn task_finished(&self, now: f64) {
        let mut queue = self.queue.lock();
        queue.exp_start = now;
        queue.refresh(now);
    }

    pub fn estimated_end(&self, now: f64) -> f64 {
        let mut queue = self.queue.lock();
        queue.refresh(now);
        queue.exp_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_running_task_delays_end() {
        let leaf = WorkerComponent::new(WorkerId(0), 0.0);
        let task = Task::control().build();
        task.set_predicted(Some(40.0), None);
        leaf.task_started(&task, 10.0);
        assert_eq!(leaf.estimated_end(10.0), 50.0);

        leaf.push(Arc::clone(&task));
        assert_eq!(leaf.estimated_end(20.0), 90.0);

        leaf.task_finished(30.0);
        assert_eq!(leaf.estimated_end(30.0), 70.0);
        assert_eq!(leaf.pop().unwrap().id(), task.id());
        assert_eq!(leaf.len(), 0);
    }
}
