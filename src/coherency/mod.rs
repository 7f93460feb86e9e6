// src/coherency/mod.rs
//! Data coherency engine
//!
//! Makes replicates valid where tasks run them. A fetch either finds the
//! data already usable on the node, or joins or creates the data requests
//! that bring it there, staging through main RAM when the two nodes cannot
//! copy directly.
//!
//! # Architecture
//!
//! ```text
//!   fetch_task_input ──> fetch_data_on_node ──┬── valid: pin, return
//!                                             └── RequestQueues::post ──> wait_request
//!   push_task_output ──> release_data_on_node ──> write-through fetches
//! ```

pub mod msi;
pub mod partition;

pub use msi::update_data_state;

use crate::data::{AccessMode, DataHandle, DataLayout, HandleHeader, HandleId, RelaxedCoherency};
use crate::memory::{BufferAddr, MemoryAllocator, MemoryNodes, NodeId, ReplicateSlot};
use crate::request::{DataRequest, RequestKind, RequestQueues, RequestStatus};
use crate::sched::{Prefetcher, WorkerId};
use crate::task::{KernelBuffer, TaskRef};
use crate::utils::errors::{Result, RuntimeError};
use crossbeam::utils::Backoff;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Owner of the request queues and the allocator, entry point for every
/// data movement
pub struct DataEngine {
    allocator: Arc<MemoryAllocator>,
    requests: RequestQueues,
    next_handle: AtomicU64,
}

impl DataEngine {
    pub fn new(allocator: Arc<MemoryAllocator>) -> Self {
        Self {
            requests: RequestQueues::new(Arc::clone(&allocator)),
            allocator,
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn allocator(&self) -> &Arc<MemoryAllocator> {
        &self.allocator
    }

    pub fn nodes(&self) -> &Arc<MemoryNodes> {
        self.allocator.nodes()
    }

    pub fn requests(&self) -> &RequestQueues {
        &self.requests
    }

    pub(crate) fn next_handle_id(&self) -> HandleId {
        HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a new handle, owned by `home` when it has initial contents
    pub fn register(&self, layout: DataLayout, home: Option<(NodeId, BufferAddr)>) -> Arc<DataHandle> {
        let handle = DataHandle::register(self.next_handle_id(), layout, home, self.nodes().count());
        debug!(handle = %handle.id(), size = handle.size(), "Registered data");
        handle
    }

    /// Make `handle` usable on `node` in `mode`, blocking until it is
    ///
    /// Unless `detached`, the replicate stays pinned until
    /// [`DataEngine::release_data_on_node`].
    pub fn fetch_data_on_node(
        &self,
        handle: &Arc<DataHandle>,
        node: NodeId,
        mode: AccessMode,
        detached: bool,
    ) -> Result<()> {
        loop {
            let request = match self.fetch_step(handle, node, mode, detached, false)? {
                None => return Ok(()),
                Some(request) => request,
            };
            match self.requests.wait_request(&request) {
                Ok(()) => {}
                // Lost to an upstream prefetch hop, ask again
                Err(_) if request.status() == RequestStatus::Dropped => {
                    trace!(?request, "Fetch retried after dropped hop");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Start moving `handle` to `node` without waiting
    ///
    /// Write-only accesses only get their buffer allocated.
    pub fn prefetch_data_on_node(&self, handle: &Arc<DataHandle>, node: NodeId, mode: AccessMode) -> Result<()> {
        self.fetch_step(handle, node, mode, true, true).map(|_| ())
    }

    /// Drop the pin taken by a fetch and propagate writes to write-through
    /// nodes
    pub fn release_data_on_node(&self, handle: &Arc<DataHandle>, node: NodeId, mode: AccessMode) {
        let write_through: Vec<NodeId> = {
            let mut header = handle.lock();
            let replicate = header.replicate_mut(node);
            replicate.refcnt = replicate.refcnt.saturating_sub(1);
            if let Some(chunk) = replicate.chunk() {
                self.allocator.memchunk_recently_used(node, chunk);
            }
            if mode.writes() {
                self.nodes()
                    .ids()
                    .filter(|&other| other != node && header.writes_through_to(other))
                    .collect()
            } else {
                Vec::new()
            }
        };
        for target in write_through {
            if let Err(err) = self.fetch_data_on_node(handle, target, AccessMode::Read, true) {
                warn!(handle = %handle.id(), error = %err, "Write-through to node {} failed", target);
            }
        }
    }

    /// Fetch every buffer of `task` for `worker` running on `node`
    ///
    /// Buffers come back in declaration order. On failure the buffers
    /// already fetched are released again.
    pub fn fetch_task_input(&self, task: &TaskRef, worker: WorkerId, node: NodeId) -> Result<Vec<KernelBuffer>> {
        let mut fetched: HashMap<HandleId, KernelBuffer> = HashMap::new();
        let mut done = Vec::new();
        for buffer in task.ordered_buffers() {
            let result = if buffer.mode.is_relaxed() {
                self.fetch_private(&buffer.handle, worker, node, buffer.mode)
            } else {
                self.fetch_data_on_node(&buffer.handle, node, buffer.mode, false)
                    .and_then(|()| self.buffer_on(&buffer.handle, node))
            };
            match result {
                Ok(addr) => {
                    fetched.insert(
                        buffer.handle.id(),
                        KernelBuffer {
                            addr,
                            layout: buffer.handle.layout().clone(),
                            mode: buffer.mode,
                        },
                    );
                    done.push(buffer.clone());
                }
                Err(err) => {
                    for buffer in done {
                        self.release_buffer(&buffer.handle, worker, node, buffer.mode);
                    }
                    return Err(err);
                }
            }
        }

        task.buffers()
            .iter()
            .map(|buffer| {
                fetched
                    .get(&buffer.handle.id())
                    .map(|fetched| KernelBuffer {
                        mode: buffer.mode,
                        ..fetched.clone()
                    })
                    .ok_or_else(|| RuntimeError::InvalidTask(format!("buffer {} was not fetched", buffer.handle.id())))
            })
            .collect()
    }

    /// Release every buffer of `task` after it ran on `node`
    pub fn push_task_output(&self, task: &TaskRef, worker: WorkerId, node: NodeId) {
        for buffer in task.ordered_buffers() {
            self.release_buffer(&buffer.handle, worker, node, buffer.mode);
        }
    }

    /// Drive request lists until none is left on any node
    pub fn wait_all_requests(&self) {
        let backoff = Backoff::new();
        while !self
            .nodes()
            .ids()
            .all(|node| self.requests.check_that_no_data_request_exists(node))
        {
            if self.requests.progress_all() == 0 {
                backoff.snooze();
            } else {
                backoff.reset();
            }
        }
    }

    /// Write `handle` back home, free every buffer the runtime allocated for
    /// it and mark it unregistered
    pub fn unregister(&self, handle: &Arc<DataHandle>) -> Result<()> {
        let home = handle.home_node();
        if handle.lock().is_partitioned() {
            self.unpartition(handle, home.unwrap_or(NodeId::MAIN_RAM))?;
        }
        if let Some(home) = home {
            if handle.lock().valid_nodes().is_empty() {
                debug!(handle = %handle.id(), "No valid copy to write back");
            } else {
                self.fetch_data_on_node(handle, home, AccessMode::Read, true)?;
            }
        }

        let backoff = Backoff::new();
        loop {
            let in_flight = handle
                .lock()
                .replicates
                .iter()
                .any(|replicate| replicate.request.is_some());
            if !in_flight {
                break;
            }
            if self.requests.progress_all() == 0 {
                backoff.snooze();
            }
        }

        let mut header = handle.lock();
        for node in self.nodes().ids() {
            if header.replicate(node).automatically_allocated() {
                self.allocator
                    .request_mem_chunk_removal(handle, &mut header, node, ReplicateSlot::Node);
            }
        }
        let workers: Vec<WorkerId> = header.per_worker.keys().copied().collect();
        for worker in workers {
            let node = header.per_worker.get(&worker).map(|replicate| replicate.node);
            if let Some(node) = node {
                self.allocator
                    .request_mem_chunk_removal(handle, &mut header, node, ReplicateSlot::Worker(worker));
            }
        }
        header.unregistered = true;
        debug!(handle = %handle.id(), "Unregistered data");
        Ok(())
    }

    /// One pass of a fetch: either done, or the request to wait for
    fn fetch_step(
        &self,
        handle: &Arc<DataHandle>,
        node: NodeId,
        mode: AccessMode,
        detached: bool,
        prefetch: bool,
    ) -> Result<Option<Arc<DataRequest>>> {
        let mut header = handle.lock();
        if header.is_partitioned() {
            return Err(RuntimeError::Partitioned(handle.id()));
        }
        let valid = header.is_valid_on(node);
        let needs_copy = mode.reads() && !valid && header.replicates.iter().any(|r| r.is_valid());
        let needs_alloc = !header.replicate(node).allocated();

        if !needs_copy && !needs_alloc {
            if prefetch {
                return Ok(None);
            }
            if !detached {
                header.replicate_mut(node).refcnt += 1;
            }
            if mode.writes() || !valid {
                update_data_state(&mut header, node, mode);
            }
            if let Some(chunk) = header.replicate(node).chunk() {
                self.allocator.memchunk_recently_used(node, chunk);
            }
            return Ok(None);
        }

        if let Some(existing) = header.replicate(node).request.clone() {
            if !prefetch {
                self.requests.update_prefetch_status(&existing);
            }
            return Ok(Some(existing));
        }

        let (request, post) = if needs_copy {
            self.create_copy_requests(handle, &mut header, node, mode, prefetch)
        } else {
            let request = self
                .requests
                .create_request(handle, &mut header, RequestKind::Allocate, node, mode, prefetch);
            (Arc::clone(&request), vec![request])
        };
        drop(header);

        trace!(?request, prefetch, "Fetch needs a request");
        for posted in post {
            self.requests.post(posted);
        }
        Ok(Some(request))
    }

    /// Requests bringing a valid copy to `dst`, directly or through main
    /// RAM; returns the last hop and the hops to post
    fn create_copy_requests(
        &self,
        handle: &Arc<DataHandle>,
        header: &mut HandleHeader,
        dst: NodeId,
        mode: AccessMode,
        prefetch: bool,
    ) -> (Arc<DataRequest>, Vec<Arc<DataRequest>>) {
        let nodes = self.nodes();
        let backend = self.allocator.backend();
        let dst_kind = nodes.kind(dst);
        let direct = |src: NodeId| backend.can_copy_direct(nodes.kind(src), dst_kind);
        let valid = header.valid_nodes();
        let direct_src = if valid.contains(&NodeId::MAIN_RAM) {
            Some(NodeId::MAIN_RAM)
        } else {
            valid.iter().copied().find(|&src| direct(src))
        };

        if let Some(src) = direct_src {
            let request = self
                .requests
                .create_request(handle, header, RequestKind::Copy { src }, dst, mode, prefetch);
            return (Arc::clone(&request), vec![request]);
        }

        // Valid only on nodes without a direct path: stage through RAM
        let src = valid[0];
        let mut post = Vec::new();
        let first = match header.replicate(NodeId::MAIN_RAM).request.clone() {
            Some(existing) => {
                if !prefetch {
                    self.requests.update_prefetch_status(&existing);
                }
                existing
            }
            None => {
                let first = self.requests.create_request(
                    handle,
                    header,
                    RequestKind::Copy { src },
                    NodeId::MAIN_RAM,
                    AccessMode::Read,
                    prefetch,
                );
                post.push(Arc::clone(&first));
                first
            }
        };
        let second = self.requests.create_request(
            handle,
            header,
            RequestKind::Copy {
                src: NodeId::MAIN_RAM,
            },
            dst,
            mode,
            prefetch,
        );
        first.chain(Arc::clone(&second));
        debug!(
            handle = %handle.id(),
            "No direct path from {} to {}, staging through RAM",
            nodes.name(src),
            nodes.name(dst)
        );
        post.push(Arc::clone(&second));
        (second, post)
    }

    fn buffer_on(&self, handle: &Arc<DataHandle>, node: NodeId) -> Result<BufferAddr> {
        handle
            .lock()
            .replicate(node)
            .buffer
            .ok_or(RuntimeError::OutOfMemory {
                node,
                requested: handle.size(),
            })
    }

    fn fetch_private(
        &self,
        handle: &Arc<DataHandle>,
        worker: WorkerId,
        node: NodeId,
        mode: AccessMode,
    ) -> Result<BufferAddr> {
        let relaxed = RelaxedCoherency::from(mode);
        let buffer = self.allocator.allocate_private(handle, worker, node, relaxed, &|| {
            self.requests.progress(node, false);
        })?;
        if let Some(replicate) = handle.lock().per_worker.get_mut(&worker) {
            replicate.refcnt += 1;
        }
        Ok(buffer)
    }

    fn release_buffer(&self, handle: &Arc<DataHandle>, worker: WorkerId, node: NodeId, mode: AccessMode) {
        if !mode.is_relaxed() {
            self.release_data_on_node(handle, node, mode);
            return;
        }
        let mut header = handle.lock();
        let Some(replicate) = header.per_worker.get_mut(&worker) else {
            return;
        };
        replicate.refcnt = replicate.refcnt.saturating_sub(1);
        let private_node = replicate.node;
        self.allocator
            .request_mem_chunk_removal(handle, &mut header, private_node, ReplicateSlot::Worker(worker));
    }
}

impl Prefetcher for DataEngine {
    fn prefetch_task_input(&self, task: &TaskRef, node: NodeId) {
        for buffer in task.ordered_buffers() {
            if buffer.mode.is_relaxed() {
                continue;
            }
            if let Err(err) = self.prefetch_data_on_node(&buffer.handle, node, buffer.mode) {
                debug!(task = %task.id(), error = %err, "Prefetch skipped");
            }
        }
    }
}

impl fmt::Debug for DataEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataEngine")
            .field("allocator", &self.allocator)
            .field("requests", &self.requests)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::MsiState;
    use crate::memory::{HostBackend, MemoryBackend, NodeKind};
    use crate::observability::NoopCounters;
    use crate::task::{Codelet, Task};
    use crate::utils::config::MemoryConfig;

    pub(crate) struct Fixture {
        pub engine: DataEngine,
        pub backend: Arc<HostBackend>,
        pub gpus: Vec<NodeId>,
    }

    /// Main RAM plus `ngpus` devices of `gpu_capacity` bytes each
    pub(crate) fn fixture(ngpus: usize, gpu_capacity: usize) -> Fixture {
        let mut nodes = MemoryNodes::new(None);
        let gpus = (0..ngpus)
            .map(|_| nodes.register(NodeKind::CudaRam, Some(gpu_capacity), false))
            .collect();
        let backend = Arc::new(HostBackend::new(false));
        let allocator = Arc::new(MemoryAllocator::new(
            Arc::new(nodes),
            backend.clone(),
            MemoryConfig::default(),
            Arc::new(NoopCounters),
        ));
        Fixture {
            engine: DataEngine::new(allocator),
            backend,
            gpus,
        }
    }

    pub(crate) fn f64_vector(fx: &Fixture, values: &[f64]) -> Arc<DataHandle> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let buffer = fx.backend.allocate_from(&bytes);
        fx.engine
            .register(DataLayout::vector(values.len(), 8), Some((NodeId::MAIN_RAM, buffer)))
    }

    pub(crate) fn read_f64(fx: &Fixture, handle: &Arc<DataHandle>, node: NodeId) -> Vec<f64> {
        let addr = handle.lock().replicate(node).buffer.unwrap();
        let mut values = Vec::new();
        fx.backend.with_bytes(node, addr, handle.size(), &mut |bytes| {
            values = bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                .collect();
        });
        values
    }

    pub(crate) fn write_f64(fx: &Fixture, handle: &Arc<DataHandle>, node: NodeId, values: &[f64]) {
        let addr = handle.lock().replicate(node).buffer.unwrap();
        fx.backend.with_bytes(node, addr, handle.size(), &mut |bytes| {
            for (chunk, value) in bytes.chunks_exact_mut(8).zip(values) {
                chunk.copy_from_slice(&value.to_le_bytes());
            }
        });
    }

    #[test]
    fn test_fetch_copies_and_shares() {
        let fx = fixture(1, 1 << 20);
        let gpu = fx.gpus[0];
        let handle = f64_vector(&fx, &[1.0, 2.0, 3.0]);

        fx.engine.fetch_data_on_node(&handle, gpu, AccessMode::Read, false).unwrap();
        assert_eq!(read_f64(&fx, &handle, gpu), vec![1.0, 2.0, 3.0]);
        {
            let header = handle.lock();
            assert_eq!(header.state(gpu), MsiState::Shared);
            assert_eq!(header.state(NodeId::MAIN_RAM), MsiState::Shared);
            assert_eq!(header.replicate(gpu).refcnt, 1);
        }
        fx.engine.release_data_on_node(&handle, gpu, AccessMode::Read);
        assert_eq!(handle.lock().replicate(gpu).refcnt, 0);
    }

    #[test]
    fn test_write_fetch_invalidates_home() {
        let fx = fixture(1, 1 << 20);
        let gpu = fx.gpus[0];
        let handle = f64_vector(&fx, &[1.0, 2.0]);

        fx.engine.fetch_data_on_node(&handle, gpu, AccessMode::Write, false).unwrap();
        let header = handle.lock();
        assert_eq!(header.owner(), Some(gpu));
        assert!(!header.is_valid_on(NodeId::MAIN_RAM));
        assert_eq!(fx.backend.copy_count(), 0);
    }

    #[test]
    fn test_device_to_device_goes_through_ram() {
        let fx = fixture(2, 1 << 20);
        let (gpu0, gpu1) = (fx.gpus[0], fx.gpus[1]);
        let handle = f64_vector(&fx, &[4.0, 5.0]);

        fx.engine.fetch_data_on_node(&handle, gpu0, AccessMode::ReadWrite, false).unwrap();
        write_f64(&fx, &handle, gpu0, &[6.0, 7.0]);
        fx.engine.release_data_on_node(&handle, gpu0, AccessMode::ReadWrite);

        fx.engine.fetch_data_on_node(&handle, gpu1, AccessMode::Read, true).unwrap();
        assert_eq!(read_f64(&fx, &handle, gpu1), vec![6.0, 7.0]);
        assert_eq!(read_f64(&fx, &handle, NodeId::MAIN_RAM), vec![6.0, 7.0]);
        let header = handle.lock();
        assert_eq!(header.valid_nodes().len(), 3);
        assert!(header.msi_consistent());
    }

    #[test]
    fn test_prefetch_then_fetch_joins_request() {
        let fx = fixture(1, 1 << 20);
        let gpu = fx.gpus[0];
        let handle = f64_vector(&fx, &[1.0; 4]);

        fx.engine.prefetch_data_on_node(&handle, gpu, AccessMode::Read).unwrap();
        assert_eq!(fx.engine.requests().len(gpu), (0, 1, 0));
        fx.engine.fetch_data_on_node(&handle, gpu, AccessMode::Read, false).unwrap();
        assert_eq!(fx.backend.copy_count(), 1);
        assert!(fx.engine.requests().check_that_no_data_request_exists(gpu));
    }

    #[test]
    fn test_write_through() {
        let fx = fixture(1, 1 << 20);
        let gpu = fx.gpus[0];
        let handle = f64_vector(&fx, &[0.0; 2]);
        handle.set_wt_mask(1 << NodeId::MAIN_RAM.index());

        fx.engine.fetch_data_on_node(&handle, gpu, AccessMode::Write, false).unwrap();
        write_f64(&fx, &handle, gpu, &[8.0, 9.0]);
        fx.engine.release_data_on_node(&handle, gpu, AccessMode::Write);
        assert_eq!(read_f64(&fx, &handle, NodeId::MAIN_RAM), vec![8.0, 9.0]);
        assert!(handle.lock().is_valid_on(NodeId::MAIN_RAM));
    }

    #[test]
    fn test_task_input_in_declaration_order() {
        let fx = fixture(1, 1 << 20);
        let gpu = fx.gpus[0];
        let a = f64_vector(&fx, &[1.0]);
        let b = f64_vector(&fx, &[2.0]);
        let codelet = Arc::new(Codelet::new("axpy", 2));
        let task = Task::builder(codelet)
            .buffer(&b, AccessMode::ReadWrite)
            .buffer(&a, AccessMode::Read)
            .build();

        let buffers = fx.engine.fetch_task_input(&task, WorkerId(0), gpu).unwrap();
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[0].addr, b.lock().replicate(gpu).buffer.unwrap());
        assert_eq!(buffers[0].mode, AccessMode::ReadWrite);
        assert_eq!(buffers[1].addr, a.lock().replicate(gpu).buffer.unwrap());
        assert_eq!(a.lock().replicate(gpu).refcnt, 1);

        fx.engine.push_task_output(&task, WorkerId(0), gpu);
        assert_eq!(a.lock().replicate(gpu).refcnt, 0);
        assert_eq!(b.lock().replicate(gpu).refcnt, 0);
        assert_eq!(b.lock().owner(), Some(gpu));
    }

    #[test]
    fn test_scratch_gets_private_buffer() {
        let fx = fixture(1, 1 << 20);
        let gpu = fx.gpus[0];
        let tmp = fx.engine.register(DataLayout::vector(16, 8), None);
        let codelet = Arc::new(Codelet::new("tmp", 1));
        let task = Task::builder(codelet).buffer(&tmp, AccessMode::Scratch).build();

        fx.engine.fetch_task_input(&task, WorkerId(3), gpu).unwrap();
        assert!(tmp.lock().per_worker.contains_key(&WorkerId(3)));
        fx.engine.push_task_output(&task, WorkerId(3), gpu);
        assert!(tmp.lock().per_worker.is_empty());
        // The buffer went to the cache
        assert_eq!(fx.engine.allocator().cached(gpu).0, 1);
    }

    #[test]
    fn test_fetch_fails_when_data_cannot_fit() {
        let fx = fixture(1, 8);
        let handle = f64_vector(&fx, &[1.0; 4]);
        let err = fx
            .engine
            .fetch_data_on_node(&handle, fx.gpus[0], AccessMode::Read, false)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfMemory { .. }));
        assert_eq!(handle.lock().replicate(fx.gpus[0]).refcnt, 0);
    }

    #[test]
    fn test_unregister_writes_back_and_frees() {
        let fx = fixture(1, 1 << 20);
        let gpu = fx.gpus[0];
        let handle = f64_vector(&fx, &[1.0, 1.0]);

        fx.engine.fetch_data_on_node(&handle, gpu, AccessMode::Write, false).unwrap();
        write_f64(&fx, &handle, gpu, &[3.0, 4.0]);
        fx.engine.release_data_on_node(&handle, gpu, AccessMode::Write);

        fx.engine.unregister(&handle).unwrap();
        assert_eq!(read_f64(&fx, &handle, NodeId::MAIN_RAM), vec![3.0, 4.0]);
        let header = handle.lock();
        assert!(header.unregistered);
        assert!(!header.replicate(gpu).allocated());
        assert_eq!(fx.engine.allocator().chunk_count(gpu), 0);
    }
}
