// src/data/requester.rs
//! Queued access requests waiting on a handle

use crate::data::mode::AccessMode;
use crate::task::TaskRef;
use std::fmt;

/// What to resume once access is granted
pub enum Waiter {
    /// Continue acquiring the buffers of a task, starting after `buffer_index`
    Job { task: TaskRef, buffer_index: usize },
    /// Run a callback (application acquire, internal synchronization)
    Callback(Box<dyn FnOnce() + Send>),
}

/// A pending access on a handle, served in FIFO order
pub struct DataRequester {
    pub mode: AccessMode,
    pub waiter: Waiter,
}

impl DataRequester {
    pub fn job(task: TaskRef, buffer_index: usize, mode: AccessMode) -> Self {
        Self {
            mode,
            waiter: Waiter::Job { task, buffer_index },
        }
    }

    pub fn callback<F: FnOnce() + Send + 'static>(mode: AccessMode, callback: F) -> Self {
        Self {
            mode,
            waiter: Waiter::Callback(Box::new(callback)),
        }
    }
}

impl fmt::Debug for DataRequester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("DataRequester");
        s.field("mode", &self.mode);
        match &self.waiter {
            Waiter::Job { task, buffer_index } => s
                .field("task", &task.id())
                .field("buffer_index", buffer_index),
            Waiter::Callback(_) => s.field("callback", &"<fn>"),
        };
        s.finish()
    }
}
