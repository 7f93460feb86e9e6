// src/sched/queue.rs
//! Task queues with expected-completion bookkeeping
//!
//! Used as the local list of FIFO and priority components and as the
//! per-worker queue of the deque-model policies. Besides the tasks, a queue
//! tracks when it is expected to drain:
//!
//! ```text
//! exp_start ──── exp_len ────> exp_end
//!  (now, or the end of the task being run)
//! ```

use crate::task::{TaskId, TaskRef};
use serde::Serialize;
use std::collections::VecDeque;

/// Ordered list of tasks waiting for a worker
#[derive(Debug)]
pub struct TaskQueue {
    tasks: VecDeque<TaskRef>,

    /// Expected time at which the first queued task can start
    pub exp_start: f64,

    /// Sum of the predicted lengths of the queued tasks
    pub exp_len: f64,

    /// `exp_start + exp_len`
    pub exp_end: f64,

    /// Tasks handed out so far
    pub nprocessed: u64,
}

/// Snapshot of a queue's estimates
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueueEstimates {
    pub ntasks: usize,
    pub exp_start: f64,
    pub exp_len: f64,
    pub exp_end: f64,
}

impl TaskQueue {
    pub fn new(now: f64) -> Self {
        Self {
            tasks: VecDeque::new(),
            exp_start: now,
            exp_len: 0.0,
            exp_end: now,
            nprocessed: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRef> {
        self.tasks.iter()
    }

    pub fn front(&self) -> Option<&TaskRef> {
        self.tasks.front()
    }

    pub fn estimates(&self) -> QueueEstimates {
        QueueEstimates {
            ntasks: self.tasks.len(),
            exp_start: self.exp_start,
            exp_len: self.exp_len,
            exp_end: self.exp_end,
        }
    }

    /// Move the expected start forward to `now` when the worker fell
    /// behind its own prediction
    pub fn refresh(&mut self, now: f64) {
        if self.exp_start < now {
            self.exp_start = now;
        }
        self.exp_end = self.exp_start + self.exp_len;
    }

    /// Account a task of `length` microseconds pushed on this queue
    pub fn account_push(&mut self, length: Option<f64>) {
        if let Some(length) = length {
            self.exp_len += length;
        }
        self.exp_end = self.exp_start + self.exp_len;
    }

    /// Append in arrival order
    pub fn push_back(&mut self, task: TaskRef) {
        let predicted = task.predicted();
        self.tasks.push_back(task);
        self.account_push(predicted);
    }

    /// Insert after every queued task of greater or equal priority
    pub fn push_sorted(&mut self, task: TaskRef) {
        let priority = task.priority();
        let pos = self
            .tasks
            .iter()
            .position(|queued| queued.priority() < priority)
            .unwrap_or(self.tasks.len());
        let predicted = task.predicted();
        self.tasks.insert(pos, task);
        self.account_push(predicted);
    }

    /// Take the head of the queue
    pub fn pop_front(&mut self) -> Option<TaskRef> {
        let task = self.tasks.pop_front()?;
        self.account_pop(&task);
        Some(task)
    }

    /// Take the tail of the queue, the end opposite to local pops
    pub fn pop_back(&mut self) -> Option<TaskRef> {
        let task = self.tasks.pop_back()?;
        self.account_pop(&task);
        Some(task)
    }

    /// First task, from the head, accepted by `can_run`
    pub fn pop_first_matching<F>(&mut self, can_run: F) -> Option<TaskRef>
    where
        F: Fn(&TaskRef) -> bool,
    {
        let pos = self.tasks.iter().position(|task| can_run(task))?;
        let task = self.tasks.remove(pos)?;
        self.account_pop(&task);
        Some(task)
    }

    /// Among the tasks with at least the head's priority, the first one
    /// with the fewest buffers not yet on the worker's node
    ///
    /// The scan stops at the first task whose inputs are all present.
    pub fn pop_first_ready<F>(&mut self, non_ready: F) -> Option<TaskRef>
    where
        F: Fn(&TaskRef) -> usize,
    {
        let first_priority = self.tasks.front()?.priority();
        let mut best = 0;
        let mut best_non_ready = usize::MAX;
        for (pos, task) in self.tasks.iter().enumerate() {
            if task.priority() < first_priority {
                continue;
            }
            let count = non_ready(task);
            if count < best_non_ready {
                best_non_ready = count;
                best = pos;
                if count == 0 {
                    break;
                }
            }
        }
        let task = self.tasks.remove(best)?;
        self.account_pop(&task);
        Some(task)
    }

    /// Remove a specific task
    pub fn remove(&mut self, id: TaskId) -> Option<TaskRef> {
        let pos = self.tasks.iter().position(|task| task.id() == id)?;
        let task = self.tasks.remove(pos)?;
        self.account_pop(&task);
        Some(task)
    }

    /// Empty the queue
    pub fn drain(&mut self) -> Vec<TaskRef> {
        self.exp_len = 0.0;
        self.exp_end = self.exp_start;
        self.tasks.drain(..).collect()
    }

    fn account_pop(&mut self, task: &TaskRef) {
        self.nprocessed += 1;
        if let Some(predicted) = task.predicted() {
            self.exp_len = (self.exp_len - predicted).max(0.0);
        }
        self.exp_end = self.exp_start + self.exp_len;
    }
}
