// src/runtime/mod.rs
//! Runtime facade
//!
//! Owns the worker threads and everything they share:
//!
//! - **State**: memory nodes, allocator, data engine, scheduling contexts
//! - **Driver**: one thread per worker running the execute loop
//! - **Facade**: data registration, acquire/release from the application,
//!   task submission, waiting and shutdown
//!
//! # Architecture
//!
//! ```text
//!  application ── submit ──▶ dependency engine ── ready ──▶ SchedContexts
//!       │                                                    │ pop
//!       │ acquire / release                                  ▼
//!       └──────────────▶ DataEngine ◀── fetch / push ── worker threads
//!                           │
//!                    MemoryAllocator ── MemoryBackend
//! ```

pub mod driver;
pub mod state;

pub use state::{TaskStats, WorkerSleep};

use crate::coherency::DataEngine;
use crate::data::{AccessMode, DataHandle, DataLayout, PartitionFilter};
use crate::deps::{acquire_data, notify_data_dependencies, submit_job_enforce_data_deps, ReadySink};
use crate::memory::{AllocatorStats, HostBackend, MemoryAllocator, MemoryBackend, NodeId};
use crate::observability::{MetricsCounters, NoopCounters, PerfCounters};
use crate::perfmodel::{ModelEstimator, TransferModel};
use crate::sched::{
    worker_may_execute_task, CtxId, Prefetcher, SchedContexts, SchedEnv, Topology, WorkerId, WorkerWaker,
};
use crate::task::TaskRef;
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::{Result, RuntimeError};
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use state::RuntimeState;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-context counters
#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub id: CtxId,
    pub name: String,
    pub policy: String,
    pub nworkers: usize,
    pub submitted: usize,
    pub finished: usize,
}

/// Snapshot of runtime activity
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub tasks: TaskStats,
    pub queued: usize,
    pub memory: AllocatorStats,
    pub copies: u64,
    pub contexts: Vec<ContextStats>,
}

/// A running task runtime
pub struct Runtime {
    state: Arc<RuntimeState>,
    backend: Arc<HostBackend>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build the machine described by `config` and start its workers
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let topology = Arc::new(Topology::from_config(&config.topology));
        let nodes = Arc::clone(topology.nodes());
        let counters: Arc<dyn PerfCounters> = if config.observability.metrics {
            Arc::new(MetricsCounters)
        } else {
            Arc::new(NoopCounters)
        };

        let backend = Arc::new(HostBackend::new(config.memory.async_copies));
        let allocator = Arc::new(MemoryAllocator::new(
            Arc::clone(&nodes),
            Arc::clone(&backend) as Arc<dyn MemoryBackend>,
            config.memory.clone(),
            Arc::clone(&counters),
        ));
        let data = Arc::new(DataEngine::new(allocator));
        let estimator = Arc::new(ModelEstimator::new(TransferModel::from_nodes(&nodes)));
        let sleep = Arc::new(WorkerSleep::new(topology.len()));

        let prefetcher: Arc<dyn Prefetcher> = data.clone();
        let waker: Arc<dyn WorkerWaker> = sleep.clone();

        let policy = config.sched.policy.clone();
        let env = SchedEnv::new(Arc::clone(&topology), estimator, config.sched.clone())
            .with_ntasks_threshold(config.ntasks_threshold_for(&policy))
            .with_prefetcher(prefetcher)
            .with_waker(waker)
            .with_counters(Arc::clone(&counters));
        let contexts = SchedContexts::new(Arc::new(env), &policy)?;

        let state = Arc::new(RuntimeState::new(
            config, Arc::clone(&topology), data, contexts, counters, sleep,
        ));
        let threads = driver::spawn_workers(&state)?;
        info!(
            nworkers = topology.len(),
            nnodes = nodes.count(),
            policy = %policy,
            "Runtime started"
        );
        Ok(Self {
            state,
            backend,
            threads: Mutex::new(threads),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.state.config
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.state.topology
    }

    pub fn data(&self) -> &Arc<DataEngine> {
        &self.state.data
    }

    pub fn contexts(&self) -> &SchedContexts {
        &self.state.contexts
    }

    /// Create a scheduling context over `workers`
    pub fn create_context(&self, name: &str, policy: &str, workers: &[WorkerId]) -> Result<CtxId> {
        self.state.contexts.create(name, policy, workers)
    }

    /// Delete a context; its queued tasks move to the initial context
    pub fn delete_context(&self, ctx: CtxId) -> Result<()> {
        self.state.contexts.delete(ctx)
    }

    /// Register data of shape `layout`
    ///
    /// With `contents`, main RAM holds the only valid copy and is the home
    /// node written back to on unregister. Without, the first access must
    /// write the data.
    pub fn register(&self, layout: DataLayout, contents: Option<&[u8]>) -> Result<Arc<DataHandle>> {
        let home = match contents {
            Some(bytes) if bytes.len() != layout.size() => {
                return Err(RuntimeError::InvalidData(format!(
                    "{} bytes given for a layout of {} bytes",
                    bytes.len(),
                    layout.size()
                )));
            }
            Some(bytes) => Some((NodeId::MAIN_RAM, self.backend.allocate_from(bytes))),
            None => None,
        };
        Ok(self.state.data.register(layout, home))
    }

    pub fn register_variable(&self, bytes: &[u8]) -> Result<Arc<DataHandle>> {
        self.register(DataLayout::Variable { elem_size: bytes.len() }, Some(bytes))
    }

    pub fn register_vector_f64(&self, values: &[f64]) -> Result<Arc<DataHandle>> {
        self.register(DataLayout::vector(values.len(), 8), Some(&f64_bytes(values)))
    }

    /// Column-major `nx` by `ny` matrix
    pub fn register_matrix_f64(&self, nx: usize, ny: usize, values: &[f64]) -> Result<Arc<DataHandle>> {
        self.register(DataLayout::matrix(nx, ny, 8), Some(&f64_bytes(values)))
    }

    pub fn register_block_f64(&self, nx: usize, ny: usize, nz: usize, values: &[f64]) -> Result<Arc<DataHandle>> {
        let layout = DataLayout::Block {
            nx,
            ny,
            nz,
            elem_size: 8,
        };
        self.register(layout, Some(&f64_bytes(values)))
    }

    /// Wait for every task using `handle`, write it back home and free the
    /// buffers the runtime allocated for it
    pub fn unregister(&self, handle: &Arc<DataHandle>) -> Result<()> {
        self.wait_idle(handle);
        self.state.data.unregister(handle)
    }

    /// Cut `handle` into `nparts` equal children once no task uses it
    pub fn partition(&self, handle: &Arc<DataHandle>, nparts: usize) -> Result<Vec<Arc<DataHandle>>> {
        self.wait_idle(handle);
        self.retry_busy(|| self.state.data.partition(handle, PartitionFilter::Block { nparts }))
    }

    /// Gather the children of `handle` back on its home node
    pub fn unpartition(&self, handle: &Arc<DataHandle>) -> Result<()> {
        let children = handle.lock().children.clone();
        for child in &children {
            self.wait_idle(child);
        }
        let gathering = handle.home_node().unwrap_or(NodeId::MAIN_RAM);
        self.retry_busy(|| self.state.data.unpartition(handle, gathering))
    }

    /// Block until the application may access `handle` in main RAM in `mode`
    ///
    /// Ordered with submitted tasks like any other access. Must be paired
    /// with [`Runtime::release`].
    pub fn acquire(&self, handle: &Arc<DataHandle>, mode: AccessMode) -> Result<()> {
        self.wait_granted(handle, mode);
        if let Err(err) = self
            .state
            .data
            .fetch_data_on_node(handle, NodeId::MAIN_RAM, mode, false)
        {
            notify_data_dependencies(handle, self.state.as_ref());
            return Err(err);
        }
        Ok(())
    }

    pub fn release(&self, handle: &Arc<DataHandle>, mode: AccessMode) {
        self.state
            .data
            .release_data_on_node(handle, NodeId::MAIN_RAM, mode);
        notify_data_dependencies(handle, self.state.as_ref());
    }

    /// Run `f` over the main RAM bytes of `handle` while holding it in `mode`
    pub fn with_data<R>(&self, handle: &Arc<DataHandle>, mode: AccessMode, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.acquire(handle, mode)?;
        let addr = handle.lock().replicate(NodeId::MAIN_RAM).buffer;
        let mut f = Some(f);
        let mut result = None;
        if let Some(addr) = addr {
            self.backend
                .with_bytes(NodeId::MAIN_RAM, addr, handle.size(), &mut |bytes| {
                    if let Some(f) = f.take() {
                        result = Some(f(bytes));
                    }
                });
        }
        self.release(handle, mode);
        result.ok_or_else(|| RuntimeError::InvalidData(format!("handle {} has no main memory buffer", handle.id())))
    }

    /// Copy of the data of `handle` as `f64` values
    pub fn read_f64(&self, handle: &Arc<DataHandle>) -> Result<Vec<f64>> {
        self.with_data(handle, AccessMode::Read, |bytes| {
            bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect()
        })
    }

    /// Submit `task` for execution once its data dependencies allow
    ///
    /// Fails without side effects when no worker of the task's context can
    /// run it.
    pub fn submit(&self, task: &TaskRef) -> Result<()> {
        if self.state.is_shut_down() {
            return Err(RuntimeError::ShutDown);
        }
        let ctx = self.state.contexts.get(task.ctx())?;
        if let Some(codelet) = task.codelet() {
            if codelet.nbuffers != task.buffers().len() {
                return Err(RuntimeError::InvalidTask(format!(
                    "codelet {} declares {} buffers, task has {}",
                    codelet.name,
                    codelet.nbuffers,
                    task.buffers().len()
                )));
            }
        }
        for buffer in task.buffers() {
            let header = buffer.handle.lock();
            if header.unregistered {
                return Err(RuntimeError::InvalidTask(format!(
                    "handle {} is unregistered",
                    buffer.handle.id()
                )));
            }
            if header.is_partitioned() {
                return Err(RuntimeError::Partitioned(buffer.handle.id()));
            }
        }
        let runnable = ctx.workers().iter().any(|worker| {
            self.state
                .topology
                .worker(worker)
                .map(|descr| worker_may_execute_task(descr, task))
                .unwrap_or(false)
        });
        if !runnable {
            return Err(RuntimeError::NoDevice(task.id()));
        }
        if !task.mark_submitted() {
            return Err(RuntimeError::AlreadySubmitted(task.id()));
        }

        ctx.task_submitted();
        self.state.counters.notify_submitted_task(ctx.id(), task.name());
        self.state.task_submitted();
        debug!(task = %task.id(), name = task.name(), ctx = %ctx.id(), "Task submitted");
        if !submit_job_enforce_data_deps(task) {
            self.state.push_ready(TaskRef::clone(task));
        }
        Ok(())
    }

    /// Block until every submitted task terminated
    pub fn wait_for_all(&self) {
        self.state.wait_for_all();
    }

    pub fn stats(&self) -> RuntimeStats {
        let contexts = self
            .state
            .contexts
            .ids()
            .into_iter()
            .filter_map(|id| self.state.contexts.get(id).ok())
            .map(|ctx| ContextStats {
                id: ctx.id(),
                name: ctx.name().to_string(),
                policy: ctx.policy().name().to_string(),
                nworkers: ctx.workers().len(),
                submitted: ctx.nsubmitted(),
                finished: ctx.nfinished(),
            })
            .collect();
        RuntimeStats {
            tasks: self.state.task_stats(),
            queued: self.state.contexts.ntasks(),
            memory: self.state.data.allocator().stats(),
            copies: self.backend.copy_count(),
            contexts,
        }
    }

    /// Wait for every task, stop the workers and free every buffer the
    /// runtime allocated
    ///
    /// Handles still registered lose the copies that only lived on devices.
    pub fn shutdown(&self) {
        if self.state.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.wait_for_all();
        self.state.sleep.wake_all();
        for thread in self.threads.lock().drain(..) {
            if thread.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        self.state.data.wait_all_requests();

        let allocator = self.state.data.allocator();
        let freed: usize = allocator
            .nodes()
            .ids()
            .map(|node| allocator.free_all_automatically_allocated_buffers(node))
            .sum();
        info!(freed_bytes = freed, stats = ?self.state.task_stats(), "Runtime shut down");
    }

    /// Wait until `handle` is granted in `mode` to the calling thread
    fn wait_granted(&self, handle: &Arc<DataHandle>, mode: AccessMode) {
        let granted = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&granted);
        acquire_data(handle, mode, move || {
            let (lock, cvar) = &*signal;
            *lock.lock() = true;
            cvar.notify_all();
        });
        let (lock, cvar) = &*granted;
        let mut done = lock.lock();
        while !*done {
            cvar.wait(&mut done);
        }
    }

    /// Wait until no task holds or waits for `handle`
    fn wait_idle(&self, handle: &Arc<DataHandle>) {
        self.wait_granted(handle, AccessMode::Write);
        notify_data_dependencies(handle, self.state.as_ref());
    }

    /// Retry while in-flight requests keep the handle busy
    fn retry_busy<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let backoff = Backoff::new();
        loop {
            match op() {
                Err(RuntimeError::HandleBusy(id)) => {
                    if backoff.is_completed() {
                        warn!(handle = %id, "Waiting for in-flight requests");
                    }
                    self.state.data.requests().progress_all();
                    backoff.snooze();
                }
                other => return other,
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("nworkers", &self.state.topology.len())
            .field("inflight", &self.state.inflight())
            .finish()
    }
}

fn f64_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::ArchKind;
    use crate::task::{Codelet, Task};
    use std::sync::atomic::AtomicUsize;

    fn config(policy: &str, ncpus: usize, ncuda: usize) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.topology.ncpus = ncpus;
        config.topology.ncuda = ncuda;
        config.sched.policy = policy.to_string();
        config.observability.metrics = false;
        config.workers.idle_timeout_us = 200;
        config
    }

    fn scale_codelet() -> Arc<Codelet> {
        Arc::new(
            Codelet::new("scale", 1)
                .with_implementation(ArchKind::Cpu, |ctx| {
                    let values: Vec<f64> = ctx.read_f64(0).iter().map(|v| v * 2.0).collect();
                    ctx.write_f64(0, &values);
                })
                .with_implementation(ArchKind::Cuda, |ctx| {
                    let values: Vec<f64> = ctx.read_f64(0).iter().map(|v| v * 2.0).collect();
                    ctx.write_f64(0, &values);
                }),
        )
    }

    #[test]
    fn test_tasks_run_in_order_on_one_handle() {
        let runtime = Runtime::new(config("eager", 2, 1)).unwrap();
        let handle = runtime.register_vector_f64(&[1.0, 2.0]).unwrap();
        let codelet = scale_codelet();
        for _ in 0..5 {
            let task = Task::builder(Arc::clone(&codelet))
                .buffer(&handle, AccessMode::ReadWrite)
                .build();
            runtime.submit(&task).unwrap();
        }
        runtime.wait_for_all();
        assert_eq!(runtime.read_f64(&handle).unwrap(), vec![32.0, 64.0]);
        assert_eq!(runtime.stats().tasks.executed, 5);
        runtime.unregister(&handle).unwrap();
        runtime.shutdown();
    }

    #[test]
    fn test_submit_twice_rejected() {
        let runtime = Runtime::new(config("eager", 1, 0)).unwrap();
        let handle = runtime.register_vector_f64(&[1.0]).unwrap();
        let task = Task::builder(scale_codelet())
            .buffer(&handle, AccessMode::ReadWrite)
            .build();
        runtime.submit(&task).unwrap();
        assert!(matches!(
            runtime.submit(&task),
            Err(RuntimeError::AlreadySubmitted(_))
        ));
        runtime.wait_for_all();
    }

    #[test]
    fn test_no_device_rejected() {
        let runtime = Runtime::new(config("eager", 1, 0)).unwrap();
        let handle = runtime.register_vector_f64(&[1.0]).unwrap();
        let gpu_only = Arc::new(Codelet::new("gpu", 1).with_implementation(ArchKind::Cuda, |_| {}));
        let task = Task::builder(gpu_only)
            .buffer(&handle, AccessMode::Read)
            .build();
        assert!(matches!(runtime.submit(&task), Err(RuntimeError::NoDevice(_))));
        assert!(!task.is_submitted());
        assert_eq!(handle.lock().refcnt, 0);
    }

    #[test]
    fn test_buffer_count_checked() {
        let runtime = Runtime::new(config("eager", 1, 0)).unwrap();
        let task = Task::builder(scale_codelet()).build();
        assert!(matches!(runtime.submit(&task), Err(RuntimeError::InvalidTask(_))));
    }

    #[test]
    fn test_register_size_checked() {
        let runtime = Runtime::new(config("eager", 1, 0)).unwrap();
        assert!(matches!(
            runtime.register(DataLayout::vector(4, 8), Some(&[0u8; 8])),
            Err(RuntimeError::InvalidData(_))
        ));
    }

    #[test]
    fn test_acquire_orders_with_tasks() {
        let runtime = Runtime::new(config("dmda", 1, 1)).unwrap();
        let handle = runtime.register_vector_f64(&[3.0]).unwrap();
        let task = Task::builder(scale_codelet())
            .buffer(&handle, AccessMode::ReadWrite)
            .build();
        runtime.submit(&task).unwrap();
        // Granted only after the task released the handle
        assert_eq!(runtime.read_f64(&handle).unwrap(), vec![6.0]);
        runtime.wait_for_all();
    }

    #[test]
    fn test_callback_runs_once() {
        let runtime = Runtime::new(config("ws", 2, 0)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&hits);
            let task = Task::control()
                .callback(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .build();
            runtime.submit(&task).unwrap();
        }
        runtime.wait_for_all();
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_shutdown_refuses_new_tasks() {
        let runtime = Runtime::new(config("eager", 1, 0)).unwrap();
        runtime.shutdown();
        let task = Task::control().build();
        assert!(matches!(runtime.submit(&task), Err(RuntimeError::ShutDown)));
        // Idempotent
        runtime.shutdown();
    }
}
