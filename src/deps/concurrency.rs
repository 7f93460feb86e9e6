// src/deps/concurrency.rs
//! Per-handle access granting

use crate::data::{AccessMode, DataHandle, DataRequester, HandleHeader, Waiter};
use crate::deps::ReadySink;
use crate::task::{TaskRef, TaskStatus};
use tracing::trace;

/// Outcome of an access attempt
#[derive(Debug)]
pub enum Attempt {
    /// Access granted, the caller resumes the requester itself
    Granted(DataRequester),
    /// Queued in the handle's requester list
    Blocked,
}

impl Attempt {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Attempt::Blocked)
    }
}

fn compatible(header: &HandleHeader, mode: AccessMode) -> bool {
    header.refcnt == 0 || (mode != AccessMode::Write && mode == header.current_mode)
}

fn grant(header: &mut HandleHeader, mode: AccessMode) {
    header.refcnt += 1;
    header.current_mode = mode;
}

/// Try to access `handle` in the requester's mode
///
/// Read-write is handled as write. Granted immediately when the handle is
/// free or held in the same shareable mode; otherwise the requester is
/// queued and resumed by [`notify_data_dependencies`].
pub fn attempt_to_submit_data_request(handle: &DataHandle, requester: DataRequester) -> Attempt {
    let mode = requester.mode.normalized();
    let mut header = handle.lock();
    if compatible(&header, mode) {
        grant(&mut header, mode);
        return Attempt::Granted(requester);
    }
    trace!(handle = %handle.id(), ?requester, "Access queued");
    header.req_list.push_back(requester);
    Attempt::Blocked
}

/// Acquire the buffers of `task` from position `start` on
///
/// Returns true when the task blocked on one of them; it is then resumed by
/// whoever releases that handle.
fn acquire_from(task: &TaskRef, start: usize) -> bool {
    let buffers = task.ordered_buffers();
    for (index, buffer) in buffers.iter().enumerate().skip(start) {
        let requester = DataRequester::job(TaskRef::clone(task), index, buffer.mode);
        if attempt_to_submit_data_request(&buffer.handle, requester).is_blocked() {
            task.set_status(TaskStatus::BlockedOnData);
            return true;
        }
    }
    false
}

/// Acquire every handle of `task`
///
/// Returns true when the task is blocked, false when it may run now.
pub fn submit_job_enforce_data_deps(task: &TaskRef) -> bool {
    acquire_from(task, 0)
}

/// Run `callback` once `handle` is accessible in `mode`
///
/// The callback runs on the calling thread when access is granted
/// immediately, otherwise on the thread releasing the handle.
pub fn acquire_data<F: FnOnce() + Send + 'static>(handle: &DataHandle, mode: AccessMode, callback: F) {
    if let Attempt::Granted(requester) = attempt_to_submit_data_request(handle, DataRequester::callback(mode, callback)) {
        resume(requester, None);
    }
}

fn may_unlock_data_req_list_head(header: &HandleHeader) -> bool {
    match header.req_list.front() {
        None => false,
        Some(_) if header.refcnt == 0 => true,
        Some(_) if header.current_mode == AccessMode::Write => false,
        Some(head) => head.mode.normalized() == header.current_mode,
    }
}

/// Release one access to `handle` and resume the requesters it unblocks
///
/// Granting happens under the header lock; tasks are resumed and pushed
/// once it is released.
pub fn notify_data_dependencies(handle: &DataHandle, sink: &dyn ReadySink) {
    let granted: Vec<DataRequester> = {
        let mut header = handle.lock();
        debug_assert!(header.refcnt > 0, "release of handle {} without a matching grant", handle.id());
        header.refcnt = header.refcnt.saturating_sub(1);
        let mut granted = Vec::new();
        while may_unlock_data_req_list_head(&header) {
            let Some(requester) = header.req_list.pop_front() else {
                break;
            };
            grant(&mut header, requester.mode.normalized());
            granted.push(requester);
        }
        granted
    };
    for requester in granted {
        resume(requester, Some(sink));
    }
}

fn resume(requester: DataRequester, sink: Option<&dyn ReadySink>) {
    match requester.waiter {
        Waiter::Callback(callback) => callback(),
        Waiter::Job { task, buffer_index } => {
            if acquire_from(&task, buffer_index + 1) {
                return;
            }
            match sink {
                Some(sink) => sink.push_ready(task),
                None => trace!(task = %task.id(), "Granted job without a sink"),
            }
        }
    }
}

/// Release every handle of a finished task
pub fn release_task_data(task: &TaskRef, sink: &dyn ReadySink) {
    for buffer in task.ordered_buffers() {
        notify_data_dependencies(&buffer.handle, sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataLayout, HandleId};
    use crate::task::{Codelet, Task};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Collect(Mutex<VecDeque<TaskRef>>);

    impl ReadySink for Collect {
        fn push_ready(&self, task: TaskRef) {
            self.0.lock().push_back(task);
        }
    }

    fn handle(id: u64) -> Arc<DataHandle> {
        DataHandle::register(HandleId(id), DataLayout::vector(4, 8), None, 1)
    }

    fn task(buffers: &[(&Arc<DataHandle>, AccessMode)]) -> TaskRef {
        let codelet = Arc::new(Codelet::new("t", buffers.len()));
        buffers
            .iter()
            .fold(Task::builder(codelet), |builder, (handle, mode)| builder.buffer(handle, *mode))
            .build()
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "without a matching grant")]
    fn test_unmatched_release_is_caught() {
        let h = handle(1);
        notify_data_dependencies(&h, &Collect::default());
    }

    #[test]
    fn test_two_writers_serialize() {
        let h = handle(1);
        let sink = Collect::default();
        let a = task(&[(&h, AccessMode::Write)]);
        let b = task(&[(&h, AccessMode::Write)]);

        assert!(!submit_job_enforce_data_deps(&a));
        assert!(submit_job_enforce_data_deps(&b));
        assert_eq!(h.lock().refcnt, 1);
        assert_eq!(h.lock().req_list.len(), 1);
        assert_eq!(b.status(), TaskStatus::BlockedOnData);

        release_task_data(&a, &sink);
        assert_eq!(sink.0.lock().pop_front().map(|t| t.id()), Some(b.id()));
        assert_eq!(h.lock().refcnt, 1);
        assert!(h.lock().req_list.is_empty());
    }

    #[test]
    fn test_readers_share_then_writer() {
        let h = handle(1);
        let sink = Collect::default();
        let r1 = task(&[(&h, AccessMode::Read)]);
        let r2 = task(&[(&h, AccessMode::Read)]);
        let w = task(&[(&h, AccessMode::ReadWrite)]);

        assert!(!submit_job_enforce_data_deps(&r1));
        assert!(!submit_job_enforce_data_deps(&r2));
        assert!(submit_job_enforce_data_deps(&w));
        assert_eq!(h.lock().refcnt, 2);
        assert_eq!(h.lock().current_mode, AccessMode::Read);

        release_task_data(&r1, &sink);
        assert!(sink.0.lock().is_empty());
        release_task_data(&r2, &sink);
        assert_eq!(sink.0.lock().len(), 1);
        assert_eq!(h.lock().current_mode, AccessMode::Write);
    }

    #[test]
    fn test_compatible_heads_granted_together() {
        let h = handle(1);
        let sink = Collect::default();
        let w = task(&[(&h, AccessMode::Write)]);
        let r1 = task(&[(&h, AccessMode::Read)]);
        let r2 = task(&[(&h, AccessMode::Read)]);
        let w2 = task(&[(&h, AccessMode::Write)]);
        for t in [&w, &r1, &r2, &w2] {
            submit_job_enforce_data_deps(t);
        }

        release_task_data(&w, &sink);
        assert_eq!(sink.0.lock().len(), 2);
        assert_eq!(h.lock().refcnt, 2);
        assert_eq!(h.lock().req_list.len(), 1);
    }

    #[test]
    fn test_scratch_accesses_share() {
        let h = handle(1);
        let a = task(&[(&h, AccessMode::Scratch)]);
        let b = task(&[(&h, AccessMode::Scratch)]);
        assert!(!submit_job_enforce_data_deps(&a));
        assert!(!submit_job_enforce_data_deps(&b));
        assert_eq!(h.lock().refcnt, 2);
    }

    #[test]
    fn test_blocked_task_resumes_remaining_handles() {
        let h1 = handle(1);
        let h2 = handle(2);
        let sink = Collect::default();
        let holder = task(&[(&h2, AccessMode::Write)]);
        let waiter = task(&[(&h1, AccessMode::Read), (&h2, AccessMode::Write)]);

        assert!(!submit_job_enforce_data_deps(&holder));
        assert!(submit_job_enforce_data_deps(&waiter));
        // h1 already granted, h2 queued
        assert_eq!(h1.lock().refcnt, 1);
        assert_eq!(h2.lock().req_list.len(), 1);

        release_task_data(&holder, &sink);
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[test]
    fn test_acquire_callback() {
        let h = handle(1);
        let sink = Collect::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        acquire_data(&h, AccessMode::Read, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&hits);
        acquire_data(&h, AccessMode::Write, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        notify_data_dependencies(&h, &sink);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(h.lock().current_mode, AccessMode::Write);
    }

    #[test]
    fn test_read_release_restores_refcnt() {
        let h = handle(1);
        let sink = Collect::default();
        let r = task(&[(&h, AccessMode::Read)]);
        submit_job_enforce_data_deps(&r);
        release_task_data(&r, &sink);
        assert_eq!(h.lock().refcnt, 0);
    }

    fn mode_strategy() -> impl Strategy<Value = AccessMode> {
        prop_oneof![
            Just(AccessMode::Read),
            Just(AccessMode::Write),
            Just(AccessMode::ReadWrite),
            Just(AccessMode::Scratch),
        ]
    }

    proptest! {
        /// Random jobs over a few handles, run one at a time in a random
        /// order: every job runs, and no two running jobs conflict
        #[test]
        fn prop_every_job_runs_without_conflict(
            jobs in prop::collection::vec(
                prop::collection::vec((0usize..4, mode_strategy()), 1..4),
                1..24,
            ),
            picks in prop::collection::vec(any::<prop::sample::Index>(), 64),
        ) {
            let handles: Vec<_> = (0..4).map(|i| handle(i as u64 + 1)).collect();
            let sink = Collect::default();
            let tasks: Vec<TaskRef> = jobs
                .iter()
                .map(|buffers| {
                    let buffers: Vec<_> = buffers.iter().map(|(h, m)| (&handles[*h], *m)).collect();
                    task(&buffers)
                })
                .collect();

            let mut running: Vec<TaskRef> = Vec::new();
            for t in &tasks {
                if !submit_job_enforce_data_deps(t) {
                    running.push(TaskRef::clone(t));
                }
            }

            let mut finished = 0;
            let mut pick = 0;
            while !running.is_empty() {
                for h in &handles {
                    let header = h.lock();
                    if header.current_mode == AccessMode::Write && header.refcnt > 0 {
                        prop_assert_eq!(header.refcnt, 1);
                    }
                    if header.refcnt == 0 {
                        prop_assert!(header.req_list.is_empty());
                    }
                }
                let index = picks[pick % picks.len()].index(running.len());
                pick += 1;
                let done = running.swap_remove(index);
                release_task_data(&done, &sink);
                finished += 1;
                running.extend(sink.0.lock().drain(..));
            }
            prop_assert_eq!(finished, tasks.len());
            for h in &handles {
                prop_assert_eq!(h.lock().refcnt, 0);
            }
        }
    }
}
