// src/request/mod.rs
//! Data requests: in-flight copies between replicates
//!
//! A request moves one handle's contents to a destination node, or only
//! allocates the destination buffer when the access does not read. Requests
//! are queued on the node that drives the copy and processed by whoever
//! progresses that node: worker driver loops, or a thread waiting on a
//! fetch.
//!
//! ```text
//!   create ──> ndeps == 0 ──> post ──> [requests | prefetch] ──> handle
//!                                                                 │
//!                                   ┌─────────── copy pending ────┤
//!                                   v                             v
//!                               [pending] ──── poll ────────> complete
//!                                                                 │
//!                                          next hops posted, callbacks run
//! ```
//!
//! While a request exists, the source and destination replicates are pinned
//! (refcount) and the destination points back at it, so eviction leaves
//! both alone and later fetches join the same request.

pub mod queues;

pub use queues::RequestQueues;

use crate::data::{AccessMode, DataHandle};
use crate::memory::{AsyncEvent, NodeId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// What a request does to its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Copy the contents from a valid replicate on `src`
    Copy { src: NodeId },
    /// Only make sure a buffer exists
    Allocate,
}

/// Progress of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Waiting on a previous hop
    Created,
    /// In a node's request or prefetch list
    Queued,
    /// Copy issued, waiting on the driver
    Pending(AsyncEvent),
    Done,
    /// Prefetch abandoned for lack of memory
    Dropped,
    /// Allocation can never succeed on the destination
    Failed,
}

impl RequestStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            RequestStatus::Done | RequestStatus::Dropped | RequestStatus::Failed
        )
    }
}

struct RequestInner {
    prefetch: bool,
    ndeps: u32,
    next: Vec<Arc<DataRequest>>,
    status: RequestStatus,
    /// Header version when the copy was issued
    issued_version: u64,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

/// One transfer towards a replicate
pub struct DataRequest {
    id: u64,
    handle: Arc<DataHandle>,
    kind: RequestKind,
    dst: NodeId,
    handling_node: NodeId,
    mode: AccessMode,
    inner: Mutex<RequestInner>,
}

impl DataRequest {
    pub(crate) fn new(
        handle: Arc<DataHandle>,
        kind: RequestKind,
        dst: NodeId,
        handling_node: NodeId,
        mode: AccessMode,
        prefetch: bool,
        ndeps: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            handle,
            kind,
            dst,
            handling_node,
            mode,
            inner: Mutex::new(RequestInner {
                prefetch,
                ndeps,
                next: Vec::new(),
                status: RequestStatus::Created,
                issued_version: 0,
                callbacks: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> &Arc<DataHandle> {
        &self.handle
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn src(&self) -> Option<NodeId> {
        match self.kind {
            RequestKind::Copy { src } => Some(src),
            RequestKind::Allocate => None,
        }
    }

    pub fn dst(&self) -> NodeId {
        self.dst
    }

    /// Node whose lists hold the request
    pub fn handling_node(&self) -> NodeId {
        self.handling_node
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_prefetch(&self) -> bool {
        self.inner.lock().prefetch
    }

    pub fn ndeps(&self) -> u32 {
        self.inner.lock().ndeps
    }

    pub fn status(&self) -> RequestStatus {
        self.inner.lock().status
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Run `callback` once the request finishes, or now if it already has
    pub fn add_callback<F: FnOnce() + Send + 'static>(&self, callback: F) {
        let mut inner = self.inner.lock();
        if inner.status.is_finished() {
            drop(inner);
            callback();
            return;
        }
        inner.callbacks.push(Box::new(callback));
    }

    /// Make `next` wait for this request
    ///
    /// Must be called with the handle's header held, which keeps the
    /// request from completing concurrently.
    pub(crate) fn chain(&self, next: Arc<DataRequest>) {
        next.inner.lock().ndeps += 1;
        self.inner.lock().next.push(next);
    }

    pub(crate) fn set_status(&self, status: RequestStatus) {
        self.inner.lock().status = status;
    }

    pub(crate) fn issue(&self, event: Option<AsyncEvent>, version: u64) {
        let mut inner = self.inner.lock();
        inner.issued_version = version;
        if let Some(event) = event {
            inner.status = RequestStatus::Pending(event);
        }
    }

    pub(crate) fn issued_version(&self) -> u64 {
        self.inner.lock().issued_version
    }

    /// Turn a prefetch into a demand request, with every later hop
    ///
    /// Returns the requests whose flag changed.
    pub(crate) fn promote(self: &Arc<Self>) -> Vec<Arc<DataRequest>> {
        let mut promoted = Vec::new();
        let mut stack = vec![Arc::clone(self)];
        while let Some(request) = stack.pop() {
            let mut inner = request.inner.lock();
            if !inner.prefetch {
                continue;
            }
            inner.prefetch = false;
            stack.extend(inner.next.iter().cloned());
            drop(inner);
            promoted.push(request);
        }
        promoted
    }

    /// Decrement the dependency count, true when it reaches zero
    pub(crate) fn release_dep(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.ndeps = inner.ndeps.saturating_sub(1);
        inner.ndeps == 0
    }

    /// Mark finished and hand back what must run after it
    pub(crate) fn finish(
        &self,
        status: RequestStatus,
    ) -> (Vec<Arc<DataRequest>>, Vec<Box<dyn FnOnce() + Send>>) {
        let mut inner = self.inner.lock();
        inner.status = status;
        (
            std::mem::take(&mut inner.next),
            std::mem::take(&mut inner.callbacks),
        )
    }
}

impl fmt::Debug for DataRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DataRequest")
            .field("id", &self.id)
            .field("handle", &self.handle.id())
            .field("kind", &self.kind)
            .field("dst", &self.dst)
            .field("handling_node", &self.handling_node)
            .field("mode", &self.mode)
            .field("prefetch", &inner.prefetch)
            .field("ndeps", &inner.ndeps)
            .field("status", &inner.status)
            .finish()
    }
}
