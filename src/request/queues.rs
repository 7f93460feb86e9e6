// src/request/queues.rs
//! Per-node request lists and their processing
//!
//! Each node keeps three lists: demand requests, prefetch requests (only
//! served when no demand request is waiting, dropped when memory is short)
//! and requests whose copy is still in flight.

use crate::coherency::update_data_state;
use crate::data::{AccessMode, DataHandle, HandleHeader};
use crate::memory::{CopyStatus, MemoryAllocator, NodeId, NodeKind};
use crate::request::{DataRequest, RequestKind, RequestStatus};
use crate::utils::errors::{Result, RuntimeError};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct NodeRequests {
    requests: VecDeque<Arc<DataRequest>>,
    prefetch: VecDeque<Arc<DataRequest>>,
    pending: Vec<Arc<DataRequest>>,
}

/// Outcome of one attempt at a queued request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    Finished,
    Pending,
    /// Put back, try again later
    Retry,
}

/// Request lists of every memory node
pub struct RequestQueues {
    allocator: Arc<MemoryAllocator>,
    nodes: Vec<Mutex<NodeRequests>>,
}

impl RequestQueues {
    pub fn new(allocator: Arc<MemoryAllocator>) -> Self {
        let nodes = (0..allocator.nodes().count())
            .map(|_| Mutex::new(NodeRequests::default()))
            .collect();
        Self { allocator, nodes }
    }

    pub fn allocator(&self) -> &Arc<MemoryAllocator> {
        &self.allocator
    }

    /// Node that drives a copy between `src` and `dst`
    ///
    /// The device side when there is one; transfers between host memories
    /// are driven from main RAM.
    pub fn select_handling_node(&self, src: Option<NodeId>, dst: NodeId) -> NodeId {
        let nodes = self.allocator.nodes();
        let is_device = |node: NodeId| !matches!(nodes.kind(node), NodeKind::CpuRam | NodeKind::Disk);
        if is_device(dst) {
            dst
        } else {
            match src {
                Some(src) if is_device(src) => src,
                _ => NodeId::MAIN_RAM,
            }
        }
    }

    /// Create a request towards `dst` and pin the replicates it uses
    ///
    /// Must be called with `header` held. The request is not posted.
    pub fn create_request(
        &self,
        handle: &Arc<DataHandle>,
        header: &mut HandleHeader,
        kind: RequestKind,
        dst: NodeId,
        mode: AccessMode,
        prefetch: bool,
    ) -> Arc<DataRequest> {
        let src = match kind {
            RequestKind::Copy { src } => Some(src),
            RequestKind::Allocate => None,
        };
        let handling_node = self.select_handling_node(src, dst);
        let request = DataRequest::new(
            Arc::clone(handle),
            kind,
            dst,
            handling_node,
            mode,
            prefetch,
            0,
        );
        if let Some(src) = src {
            header.replicate_mut(src).refcnt += 1;
        }
        let replicate = header.replicate_mut(dst);
        replicate.refcnt += 1;
        replicate.request = Some(Arc::clone(&request));
        header.busy_count += 1;
        trace!(?request, "Data request created");
        request
    }

    /// Queue a request whose dependencies are all done
    pub fn post(&self, request: Arc<DataRequest>) {
        if request.ndeps() > 0 {
            return;
        }
        let prefetch = request.is_prefetch();
        let node = request.handling_node();
        request.set_status(RequestStatus::Queued);
        self.allocator
            .counters()
            .notify_data_request(node, prefetch);
        let mut lists = self.nodes[node.index()].lock();
        if prefetch {
            lists.prefetch.push_back(request);
        } else {
            lists.requests.push_back(request);
        }
    }

    /// Turn a queued prefetch into a demand request
    pub fn update_prefetch_status(&self, request: &Arc<DataRequest>) {
        for promoted in request.promote() {
            let mut lists = self.nodes[promoted.handling_node().index()].lock();
            if let Some(pos) = lists
                .prefetch
                .iter()
                .position(|queued| Arc::ptr_eq(queued, &promoted))
            {
                if let Some(queued) = lists.prefetch.remove(pos) {
                    lists.requests.push_back(queued);
                }
            }
        }
    }

    /// Process the demand list of `node`; returns the requests finished
    pub fn handle_node_data_requests(&self, node: NodeId, may_alloc: bool) -> usize {
        let batch: Vec<_> = self.nodes[node.index()].lock().requests.drain(..).collect();
        let mut finished = 0;
        let mut retry = Vec::new();
        for request in batch {
            match self.handle_request(&request, may_alloc) {
                Handled::Finished => finished += 1,
                Handled::Pending => self.nodes[node.index()].lock().pending.push(request),
                Handled::Retry => retry.push(request),
            }
        }
        if !retry.is_empty() {
            let mut lists = self.nodes[node.index()].lock();
            for request in retry.into_iter().rev() {
                lists.requests.push_front(request);
            }
        }
        finished
    }

    /// Process the prefetch list of `node` if no demand request waits
    pub fn handle_node_prefetch_requests(&self, node: NodeId, may_alloc: bool) -> usize {
        let batch: Vec<_> = {
            let mut lists = self.nodes[node.index()].lock();
            if !lists.requests.is_empty() {
                return 0;
            }
            lists.prefetch.drain(..).collect()
        };
        let mut finished = 0;
        let mut retry = Vec::new();
        for request in batch {
            match self.handle_request(&request, may_alloc) {
                Handled::Finished => finished += 1,
                Handled::Pending => self.nodes[node.index()].lock().pending.push(request),
                Handled::Retry => retry.push(request),
            }
        }
        if !retry.is_empty() {
            let mut lists = self.nodes[node.index()].lock();
            for request in retry.into_iter().rev() {
                // May have been promoted meanwhile
                if request.is_prefetch() {
                    lists.prefetch.push_front(request);
                } else {
                    lists.requests.push_front(request);
                }
            }
        }
        finished
    }

    /// Poll the copies in flight on `node`, waiting for them when `force`
    pub fn handle_pending_node_data_requests(&self, node: NodeId, force: bool) -> usize {
        let batch: Vec<_> = std::mem::take(&mut self.nodes[node.index()].lock().pending);
        let backend = self.allocator.backend();
        let mut finished = 0;
        let mut still_pending = Vec::new();
        for request in batch {
            let RequestStatus::Pending(event) = request.status() else {
                continue;
            };
            let done = if force {
                backend.wait_completion(event);
                true
            } else {
                backend.test_completion(event)
            };
            if !done {
                still_pending.push(request);
                continue;
            }
            // The header may be held by a thread waiting on another copy
            let handle = Arc::clone(request.handle());
            match handle.try_lock() {
                Some(mut header) => {
                    let follow_up = self.complete(&request, &mut header, RequestStatus::Done);
                    drop(header);
                    self.run_follow_up(follow_up);
                    finished += 1;
                }
                None => still_pending.push(request),
            };
        }
        self.nodes[node.index()].lock().pending.extend(still_pending);
        finished
    }

    /// One round of progress on `node`
    pub fn progress(&self, node: NodeId, may_alloc: bool) -> usize {
        let mut finished = self.handle_node_data_requests(node, may_alloc);
        finished += self.handle_node_prefetch_requests(node, may_alloc);
        finished += self.handle_pending_node_data_requests(node, false);
        self.allocator.memchunk_tidy(node);
        finished
    }

    pub fn progress_all(&self) -> usize {
        (0..self.nodes.len())
            .map(|node| self.progress(NodeId(node), true))
            .sum()
    }

    /// Drive requests until `request` finishes
    ///
    /// A dropped prefetch or an allocation that cannot fit surfaces as
    /// [`RuntimeError::OutOfMemory`].
    pub fn wait_request(&self, request: &Arc<DataRequest>) -> Result<()> {
        let backoff = Backoff::new();
        loop {
            match request.status() {
                RequestStatus::Done => return Ok(()),
                RequestStatus::Dropped | RequestStatus::Failed => {
                    return Err(RuntimeError::OutOfMemory {
                        node: request.dst(),
                        requested: request.handle().size(),
                    })
                }
                _ => {}
            }
            if self.progress_all() == 0 {
                backoff.snooze();
            } else {
                backoff.reset();
            }
        }
    }

    /// Whether `node` has no request left in any list
    pub fn check_that_no_data_request_exists(&self, node: NodeId) -> bool {
        let lists = self.nodes[node.index()].lock();
        lists.requests.is_empty() && lists.prefetch.is_empty() && lists.pending.is_empty()
    }

    /// Number of requests queued or in flight on `node`
    pub fn len(&self, node: NodeId) -> (usize, usize, usize) {
        let lists = self.nodes[node.index()].lock();
        (lists.requests.len(), lists.prefetch.len(), lists.pending.len())
    }

    fn handle_request(&self, request: &Arc<DataRequest>, may_alloc: bool) -> Handled {
        let handle = Arc::clone(request.handle());
        let dst = request.dst();

        let allocated = handle
            .try_lock()
            .map(|header| header.replicate(dst).allocated());
        match allocated {
            None => return Handled::Retry,
            Some(true) => {}
            Some(false) if !may_alloc => return Handled::Retry,
            Some(false) => {
                let prefetch = request.is_prefetch();
                if let Err(err) = self
                    .allocator
                    .allocate_memory_on_node(&handle, dst, prefetch, &|| {})
                {
                    return self.allocation_failed(request, prefetch, &err);
                }
            }
        }

        let Some(mut header) = handle.try_lock() else {
            return Handled::Retry;
        };
        if !header.replicate(dst).allocated() {
            // Evicted again before we got the header back
            return Handled::Retry;
        }
        let RequestKind::Copy { src } = request.kind() else {
            let follow_up = self.complete(request, &mut header, RequestStatus::Done);
            drop(header);
            self.run_follow_up(follow_up);
            return Handled::Finished;
        };

        let (Some(from), Some(to)) = (header.replicate(src).buffer, header.replicate(dst).buffer) else {
            warn!(?request, "Copy without a source buffer");
            let follow_up = self.complete(request, &mut header, RequestStatus::Done);
            drop(header);
            self.run_follow_up(follow_up);
            return Handled::Finished;
        };
        let size = handle.size();
        self.allocator.counters().notify_transfer(src, dst, size);
        match self.allocator.backend().copy(src, from, dst, to, size) {
            CopyStatus::Done => {
                request.issue(None, header.version);
                let follow_up = self.complete(request, &mut header, RequestStatus::Done);
                drop(header);
                self.run_follow_up(follow_up);
                Handled::Finished
            }
            CopyStatus::Pending(event) => {
                request.issue(Some(event), header.version);
                trace!(?request, "Copy in flight");
                Handled::Pending
            }
        }
    }

    fn allocation_failed(&self, request: &Arc<DataRequest>, prefetch: bool, err: &RuntimeError) -> Handled {
        let dst = request.dst();
        let status = if prefetch {
            debug!(?request, error = %err, "Dropping prefetch");
            RequestStatus::Dropped
        } else if self
            .allocator
            .manager()
            .total(dst)
            .is_some_and(|total| total < request.handle().size())
        {
            warn!(?request, error = %err, "Data can never fit on node {}", dst);
            RequestStatus::Failed
        } else {
            return Handled::Retry;
        };
        let handle = Arc::clone(request.handle());
        let mut header = handle.lock();
        let follow_up = self.complete(request, &mut header, status);
        drop(header);
        self.run_follow_up(follow_up);
        Handled::Finished
    }

    /// Settle a request under its handle's header
    ///
    /// A successful copy makes the destination valid unless the source was
    /// written meanwhile. A request that did not succeed takes every later
    /// hop down with it.
    fn complete(
        &self,
        request: &Arc<DataRequest>,
        header: &mut HandleHeader,
        status: RequestStatus,
    ) -> FollowUp {
        let dst = request.dst();
        if status == RequestStatus::Done {
            if let RequestKind::Copy { src } = request.kind() {
                if header.is_valid_on(src) && header.version == request.issued_version() {
                    update_data_state(header, dst, AccessMode::Read);
                } else {
                    debug!(?request, "Source changed during the copy, not validating");
                }
            }
            if let Some(chunk) = header.replicate(dst).chunk() {
                self.allocator.memchunk_recently_used(dst, chunk);
            }
        }
        self.unpin(request, header);

        let (next, callbacks) = request.finish(status);
        let mut follow_up = FollowUp {
            post: Vec::new(),
            callbacks,
        };
        for hop in next {
            if status == RequestStatus::Done {
                if hop.release_dep() {
                    follow_up.post.push(hop);
                }
            } else {
                let nested = self.complete(&hop, header, status);
                follow_up.post.extend(nested.post);
                follow_up.callbacks.extend(nested.callbacks);
            }
        }
        follow_up
    }

    fn unpin(&self, request: &Arc<DataRequest>, header: &mut HandleHeader) {
        if let Some(src) = request.src() {
            let replicate = header.replicate_mut(src);
            replicate.refcnt = replicate.refcnt.saturating_sub(1);
        }
        let replicate = header.replicate_mut(request.dst());
        replicate.refcnt = replicate.refcnt.saturating_sub(1);
        if replicate
            .request
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, request))
        {
            replicate.request = None;
        }
        header.busy_count = header.busy_count.saturating_sub(1);
    }

    fn run_follow_up(&self, follow_up: FollowUp) {
        for hop in follow_up.post {
            self.post(hop);
        }
        for callback in follow_up.callbacks {
            callback();
        }
    }
}

/// Work to do once the header is released
struct FollowUp {
    post: Vec<Arc<DataRequest>>,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for RequestQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueues")
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataLayout, HandleId, MsiState};
    use crate::memory::{HostBackend, MemoryNodes, NodeKind};
    use crate::observability::NoopCounters;
    use crate::utils::config::MemoryConfig;

    struct Fixture {
        queues: RequestQueues,
        backend: Arc<HostBackend>,
        gpu: NodeId,
    }

    fn fixture(async_copies: bool, gpu_capacity: usize) -> Fixture {
        let mut nodes = MemoryNodes::new(None);
        let gpu = nodes.register(NodeKind::CudaRam, Some(gpu_capacity), false);
        let backend = Arc::new(HostBackend::new(async_copies));
        let allocator = Arc::new(MemoryAllocator::new(
            Arc::new(nodes),
            backend.clone(),
            MemoryConfig::default(),
            Arc::new(NoopCounters),
        ));
        Fixture {
            queues: RequestQueues::new(allocator),
            backend,
            gpu,
        }
    }

    fn ram_handle(fx: &Fixture, bytes: &[u8]) -> Arc<DataHandle> {
        let buffer = fx.backend.allocate_from(bytes);
        DataHandle::register(
            HandleId(1),
            DataLayout::vector(bytes.len(), 1),
            Some((NodeId::MAIN_RAM, buffer)),
            2,
        )
    }

    fn copy_to_gpu(fx: &Fixture, handle: &Arc<DataHandle>, prefetch: bool) -> Arc<DataRequest> {
        let mut header = handle.lock();
        let request = fx.queues.create_request(
            handle,
            &mut header,
            RequestKind::Copy { src: NodeId::MAIN_RAM },
            fx.gpu,
            AccessMode::Read,
            prefetch,
        );
        drop(header);
        fx.queues.post(Arc::clone(&request));
        request
    }

    #[test]
    fn test_copy_validates_destination() {
        let fx = fixture(false, 1024);
        let handle = ram_handle(&fx, &[1, 2, 3, 4]);
        let request = copy_to_gpu(&fx, &handle, false);
        assert_eq!(request.handling_node(), fx.gpu);
        assert_eq!(handle.lock().replicate(fx.gpu).refcnt, 1);

        assert_eq!(fx.queues.progress(fx.gpu, true), 1);
        assert_eq!(request.status(), RequestStatus::Done);
        let header = handle.lock();
        assert_eq!(header.state(fx.gpu), MsiState::Shared);
        assert_eq!(header.state(NodeId::MAIN_RAM), MsiState::Shared);
        assert_eq!(header.replicate(fx.gpu).refcnt, 0);
        assert_eq!(header.replicate(NodeId::MAIN_RAM).refcnt, 0);
        assert!(header.replicate(fx.gpu).request.is_none());
        drop(header);
        assert!(fx.queues.check_that_no_data_request_exists(fx.gpu));
    }

    #[test]
    fn test_async_copy_goes_through_pending_list() {
        let fx = fixture(true, 1024);
        let handle = ram_handle(&fx, &[9; 8]);
        let request = copy_to_gpu(&fx, &handle, false);

        assert_eq!(fx.queues.handle_node_data_requests(fx.gpu, true), 0);
        assert_eq!(fx.queues.len(fx.gpu), (0, 0, 1));
        assert!(!handle.lock().is_valid_on(fx.gpu));

        fx.queues.wait_request(&request).unwrap();
        assert!(handle.lock().is_valid_on(fx.gpu));
        assert!(fx.queues.check_that_no_data_request_exists(fx.gpu));
    }

    #[test]
    fn test_pending_copy_waits_for_busy_header() {
        let fx = fixture(true, 1024);
        let handle = ram_handle(&fx, &[5; 8]);
        let request = copy_to_gpu(&fx, &handle, false);
        fx.queues.handle_node_data_requests(fx.gpu, true);

        let held = handle.lock();
        assert_eq!(fx.queues.handle_pending_node_data_requests(fx.gpu, true), 0);
        assert_eq!(fx.queues.len(fx.gpu), (0, 0, 1));
        drop(held);

        assert_eq!(fx.queues.handle_pending_node_data_requests(fx.gpu, true), 1);
        assert!(request.is_finished());
        assert!(handle.lock().is_valid_on(fx.gpu));
    }

    #[test]
    fn test_prefetch_waits_for_demand_requests() {
        let fx = fixture(false, 1024);
        let handle = ram_handle(&fx, &[1; 4]);
        let prefetch = copy_to_gpu(&fx, &handle, true);
        assert_eq!(fx.queues.len(fx.gpu), (0, 1, 0));

        fx.queues.update_prefetch_status(&prefetch);
        assert!(!prefetch.is_prefetch());
        assert_eq!(fx.queues.len(fx.gpu), (1, 0, 0));
        fx.queues.progress(fx.gpu, true);
        assert!(prefetch.is_finished());
    }

    #[test]
    fn test_prefetch_dropped_without_memory() {
        let fx = fixture(false, 2);
        let handle = ram_handle(&fx, &[1; 16]);
        let request = copy_to_gpu(&fx, &handle, true);

        fx.queues.progress(fx.gpu, true);
        assert_eq!(request.status(), RequestStatus::Dropped);
        let header = handle.lock();
        assert!(!header.is_valid_on(fx.gpu));
        assert_eq!(header.replicate(NodeId::MAIN_RAM).refcnt, 0);
        assert!(header.replicate(fx.gpu).request.is_none());
    }

    #[test]
    fn test_oversized_demand_fails() {
        let fx = fixture(false, 2);
        let handle = ram_handle(&fx, &[1; 16]);
        let request = copy_to_gpu(&fx, &handle, false);
        assert!(matches!(
            fx.queues.wait_request(&request),
            Err(RuntimeError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_chained_hop_posted_after_first() {
        let fx = fixture(false, 1024);
        let handle = ram_handle(&fx, &[5; 4]);
        let first = copy_to_gpu(&fx, &handle, false);
        let second = {
            let mut header = handle.lock();
            let second = fx.queues.create_request(
                &handle,
                &mut header,
                RequestKind::Allocate,
                NodeId::MAIN_RAM,
                AccessMode::Read,
                false,
            );
            first.chain(Arc::clone(&second));
            second
        };
        fx.queues.post(Arc::clone(&second));
        assert_eq!(second.status(), RequestStatus::Created);

        fx.queues.progress(fx.gpu, true);
        assert_eq!(second.status(), RequestStatus::Queued);
        fx.queues.progress(NodeId::MAIN_RAM, true);
        assert!(second.is_finished());
    }
}
