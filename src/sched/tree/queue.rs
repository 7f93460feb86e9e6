// src/sched/tree/queue.rs
//! FIFO and priority components

use crate::sched::queue::TaskQueue;
use crate::task::TaskRef;
use parking_lot::Mutex;

/// Local task list, optionally bounded
pub struct QueueComponent {
    queue: Mutex<TaskQueue>,
    sorted: bool,
    /// `(ntasks, exp_len)` above which the queue reports no room
    thresholds: Option<(usize, f64)>,
}

impl QueueComponent {
    pub fn new(now: f64, sorted: bool, thresholds: Option<(usize, f64)>) -> Self {
        Self {
            queue: Mutex::new(TaskQueue::new(now)),
            sorted,
            thresholds,
        }
    }

    pub fn push(&self, task: TaskRef) {
        let mut queue = self.queue.lock();
        if self.sorted {
            queue.push_sorted(task);
        } else {
            queue.push_back(task);
        }
    }

    /// First task, from the head, the popping worker can run
    pub fn pop<F>(&self, can_run: F) -> Option<TaskRef>
    where
        F: Fn(&TaskRef) -> bool,
    {
        self.queue.lock().pop_first_matching(can_run)
    }

    pub fn has_room(&self) -> bool {
        match self.thresholds {
            Some((ntasks, exp_len)) => {
                let queue = self.queue.lock();
                queue.len() < ntasks && queue.exp_len < exp_len
            }
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn exp_len(&self) -> f64 {
        self.queue.lock().exp_len
    }

    pub fn drain(&self) -> Vec<TaskRef> {
        self.queue.lock().drain()
    }
}
