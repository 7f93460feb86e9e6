// src/data/replicate.rs
//! Per-node copy of a data handle

use crate::data::mode::{MsiState, RelaxedCoherency};
use crate::memory::{BufferAddr, ChunkId, NodeId};
use crate::request::DataRequest;
use std::sync::Arc;

/// Who provided the buffer backing a replicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    /// Registered by the application, never freed by the runtime
    Application,
    /// Allocated by the runtime and tracked by a memory chunk
    Runtime(ChunkId),
    /// Slice of the parent's buffer after a partition
    ParentView,
}

/// One memory-node-local copy of a handle
#[derive(Debug, Clone)]
pub struct Replicate {
    pub node: NodeId,

    pub state: MsiState,

    /// Accessors and transfers currently pinning the buffer
    pub refcnt: u32,

    pub relaxed_coherency: RelaxedCoherency,

    pub buffer: Option<BufferAddr>,

    pub origin: BufferOrigin,

    /// Transfer currently filling this replicate
    pub request: Option<Arc<DataRequest>>,
}

impl Replicate {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            state: MsiState::Invalid,
            refcnt: 0,
            relaxed_coherency: RelaxedCoherency::None,
            buffer: None,
            origin: BufferOrigin::Application,
            request: None,
        }
    }

    pub fn allocated(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn automatically_allocated(&self) -> bool {
        self.allocated() && matches!(self.origin, BufferOrigin::Runtime(_))
    }

    pub fn chunk(&self) -> Option<ChunkId> {
        match (self.buffer, self.origin) {
            (Some(_), BufferOrigin::Runtime(chunk)) => Some(chunk),
            _ => None,
        }
    }

    /// Whether the buffer is a slice of the parent's buffer
    pub fn is_view(&self) -> bool {
        self.allocated() && self.origin == BufferOrigin::ParentView
    }

    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    /// Attach a buffer
    pub fn install(&mut self, buffer: BufferAddr, origin: BufferOrigin) {
        self.buffer = Some(buffer);
        self.origin = origin;
    }

    /// Forget the buffer; the caller takes care of the memory
    pub fn detach(&mut self) -> Option<BufferAddr> {
        self.state = MsiState::Invalid;
        self.origin = BufferOrigin::Application;
        self.buffer.take()
    }
}
