// src/task/mod.rs
//! Tasks, codelets and task bundles
//!
//! - **Task**: one unit of work over a list of (handle, mode) buffers
//! - **Codelet**: the kernel a task runs, with per-architecture variants
//! - **Bundle**: tasks the scheduler should place together
//!
//! A task is immutable once built except for the scheduling information
//! policies attach to it (prediction, chosen implementation, status).

pub mod bundle;
pub mod codelet;

pub use bundle::TaskBundle;
pub use codelet::{Codelet, Implementation, KernelBuffer, KernelContext, KernelFn};

use crate::data::{AccessMode, DataHandle, Footprint};
use crate::sched::{CtxId, WorkerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

static TASK_FOOTPRINT_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Shared reference to a task
pub type TaskRef = Arc<Task>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One buffer of a task
#[derive(Debug, Clone)]
pub struct BufferDescr {
    pub handle: Arc<DataHandle>,
    pub mode: AccessMode,
}

/// Lifecycle of a task inside the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    Init,
    BlockedOnData,
    Ready,
    Running,
    Finished,
}

/// Information attached by the scheduler
#[derive(Debug, Clone, Default)]
pub struct SchedInfo {
    /// Expected execution time in microseconds
    pub predicted: Option<f64>,

    /// Expected input transfer time in microseconds
    pub predicted_transfer: Option<f64>,

    /// Implementation chosen for the worker that will run the task
    pub implementation: usize,

    pub status: TaskStatus,

    /// Worker the task was assigned to, when known at push time
    pub worker: Option<WorkerId>,
}

/// A unit of work
pub struct Task {
    id: TaskId,
    name: String,
    codelet: Option<Arc<Codelet>>,
    buffers: Vec<BufferDescr>,
    ordered_buffers: Vec<BufferDescr>,
    priority: i32,
    ctx: CtxId,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    bundle: Mutex<Option<Weak<TaskBundle>>>,
    sched: Mutex<SchedInfo>,
    submitted: AtomicBool,
}

impl Task {
    pub fn builder(codelet: Arc<Codelet>) -> TaskBuilder {
        TaskBuilder::new(Some(codelet))
    }

    /// Task without a kernel, used to synchronize on data
    pub fn control() -> TaskBuilder {
        TaskBuilder::new(None)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codelet(&self) -> Option<&Arc<Codelet>> {
        self.codelet.as_ref()
    }

    /// Buffers in declaration order
    pub fn buffers(&self) -> &[BufferDescr] {
        &self.buffers
    }

    /// Buffers sorted by handle identity, duplicates merged
    pub fn ordered_buffers(&self) -> &[BufferDescr] {
        &self.ordered_buffers
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn ctx(&self) -> CtxId {
        self.ctx
    }

    pub fn sched_info(&self) -> SchedInfo {
        self.sched.lock().clone()
    }

    pub fn update_sched_info<R>(&self, f: impl FnOnce(&mut SchedInfo) -> R) -> R {
        f(&mut self.sched.lock())
    }

    pub fn predicted(&self) -> Option<f64> {
        self.sched.lock().predicted
    }

    pub fn set_predicted(&self, predicted: Option<f64>, transfer: Option<f64>) {
        let mut info = self.sched.lock();
        info.predicted = predicted;
        info.predicted_transfer = transfer;
    }

    pub fn status(&self) -> TaskStatus {
        self.sched.lock().status
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.sched.lock().status = status;
    }

    /// Mark the task submitted; false if it already was
    pub(crate) fn mark_submitted(&self) -> bool {
        !self.submitted.swap(true, Ordering::AcqRel)
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    pub(crate) fn take_callback(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.callback.lock().take()
    }

    pub fn bundle(&self) -> Option<Arc<TaskBundle>> {
        self.bundle.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_bundle(&self, bundle: Option<Weak<TaskBundle>>) {
        *self.bundle.lock() = bundle;
    }

    /// Structural footprint of the task's buffers
    pub fn footprint(&self) -> Footprint {
        let mut digest = TASK_FOOTPRINT_CRC.digest();
        for buffer in &self.buffers {
            digest.update(&buffer.handle.layout().footprint().0.to_le_bytes());
        }
        Footprint(digest.finalize())
    }

    /// Total bytes the task touches
    pub fn data_size(&self) -> usize {
        self.ordered_buffers.iter().map(|b| b.handle.size()).sum()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("ctx", &self.ctx)
            .field("nbuffers", &self.buffers.len())
            .finish()
    }
}

/// Builder for [`Task`]
pub struct TaskBuilder {
    name: Option<String>,
    codelet: Option<Arc<Codelet>>,
    buffers: Vec<BufferDescr>,
    priority: i32,
    ctx: CtxId,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskBuilder {
    fn new(codelet: Option<Arc<Codelet>>) -> Self {
        Self {
            name: None,
            codelet,
            buffers: Vec::new(),
            priority: 0,
            ctx: CtxId::INITIAL,
            callback: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn buffer(mut self, handle: &Arc<DataHandle>, mode: AccessMode) -> Self {
        self.buffers.push(BufferDescr {
            handle: Arc::clone(handle),
            mode,
        });
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn context(mut self, ctx: CtxId) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn callback<F: FnOnce() + Send + 'static>(mut self, callback: F) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> TaskRef {
        let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        let name = self.name.unwrap_or_else(|| match &self.codelet {
            Some(codelet) => codelet.name.clone(),
            None => "control".to_string(),
        });
        let ordered_buffers = sort_buffers(&self.buffers);

        Arc::new(Task {
            id,
            name,
            codelet: self.codelet,
            buffers: self.buffers,
            ordered_buffers,
            priority: self.priority,
            ctx: self.ctx,
            callback: Mutex::new(self.callback),
            bundle: Mutex::new(None),
            sched: Mutex::new(SchedInfo::default()),
            submitted: AtomicBool::new(false),
        })
    }
}

/// Sort buffers by handle identity and merge repeated handles, so that a
/// task acquires each handle once and always in the same global order
pub fn sort_buffers(buffers: &[BufferDescr]) -> Vec<BufferDescr> {
    let mut ordered = buffers.to_vec();
    ordered.sort_by_key(|b| b.handle.id());
    let mut merged: Vec<BufferDescr> = Vec::with_capacity(ordered.len());
    for buffer in ordered {
        match merged.last_mut() {
            Some(last) if last.handle.id() == buffer.handle.id() => {
                last.mode = last.mode.merge(buffer.mode);
            }
            _ => merged.push(buffer),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataLayout, HandleId};
    use crate::memory::{BufferAddr, NodeId};

    fn handle(id: u64) -> Arc<DataHandle> {
        DataHandle::register(
            HandleId(id),
            DataLayout::vector(4, 4),
            Some((NodeId::MAIN_RAM, BufferAddr::new(id))),
            1,
        )
    }

    #[test]
    fn test_buffers_sorted_by_identity() {
        let (a, b, c) = (handle(3), handle(1), handle(2));
        let task = Task::control()
            .buffer(&a, AccessMode::Read)
            .buffer(&b, AccessMode::Write)
            .buffer(&c, AccessMode::Read)
            .build();

        let ids: Vec<u64> = task.ordered_buffers().iter().map(|b| b.handle.id().0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        // Declaration order is kept for kernels
        assert_eq!(task.buffers()[0].handle.id(), HandleId(3));
    }

    #[test]
    fn test_duplicate_handles_merged() {
        let a = handle(7);
        let task = Task::control()
            .buffer(&a, AccessMode::Read)
            .buffer(&a, AccessMode::Write)
            .build();
        assert_eq!(task.ordered_buffers().len(), 1);
        assert_eq!(task.ordered_buffers()[0].mode, AccessMode::ReadWrite);
    }

    #[test]
    fn test_submitted_once() {
        let task = Task::control().build();
        assert!(task.mark_submitted());
        assert!(!task.mark_submitted());
    }

    #[test]
    fn test_footprint_depends_on_shapes() {
        let a = handle(1);
        let big = DataHandle::register(HandleId(9), DataLayout::vector(64, 4), None, 1);
        let t1 = Task::control().buffer(&a, AccessMode::Read).build();
        let t2 = Task::control().buffer(&a, AccessMode::Write).build();
        let t3 = Task::control().buffer(&big, AccessMode::Read).build();
        assert_eq!(t1.footprint(), t2.footprint());
        assert_ne!(t1.footprint(), t3.footprint());
    }
}
