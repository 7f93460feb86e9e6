// src/memory/backend.rs
//! Driver boundary for buffers and copies
//!
//! Device drivers implement [`MemoryBackend`]. The runtime only asks for
//! raw allocations, frees and copies; capacity accounting, caching and
//! eviction happen above this layer. [`HostBackend`] keeps every node's
//! buffers in host memory so the runtime can run without devices.

use crate::memory::{NodeId, NodeKind};
use crate::utils::errors::{Result, RuntimeError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

/// Address of a buffer on some node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferAddr {
    pub base: u64,
    pub offset: usize,
}

impl BufferAddr {
    pub fn new(base: u64) -> Self {
        Self { base, offset: 0 }
    }

    /// Address `offset` bytes further into the same allocation
    pub fn at(self, offset: usize) -> Self {
        Self {
            base: self.base,
            offset: self.offset + offset,
        }
    }
}

/// Completion token of an asynchronous copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncEvent(pub u64);

/// Outcome of starting a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Done,
    /// Poll the event until it completes
    Pending(AsyncEvent),
}

/// Raw memory operations of a driver
pub trait MemoryBackend: Send + Sync {
    fn allocate(&self, node: NodeId, size: usize) -> Result<BufferAddr>;

    fn free(&self, node: NodeId, addr: BufferAddr, size: usize);

    fn copy(
        &self,
        src_node: NodeId,
        src: BufferAddr,
        dst_node: NodeId,
        dst: BufferAddr,
        size: usize,
    ) -> CopyStatus;

    fn test_completion(&self, event: AsyncEvent) -> bool;

    fn wait_completion(&self, event: AsyncEvent) {
        let backoff = crossbeam::utils::Backoff::new();
        while !self.test_completion(event) {
            backoff.snooze();
        }
    }

    /// Whether a copy between these kinds can be issued without staging
    /// through main RAM
    fn can_copy_direct(&self, src: NodeKind, dst: NodeKind) -> bool {
        src == NodeKind::CpuRam || dst == NodeKind::CpuRam
    }

    /// Give `f` access to the bytes of a buffer
    fn with_bytes(&self, node: NodeId, addr: BufferAddr, len: usize, f: &mut dyn FnMut(&mut [u8]));
}

/// Backend storing all buffers in host memory
#[derive(Debug)]
pub struct HostBackend {
    buffers: DashMap<u64, Vec<u8>>,
    next_base: AtomicU64,
    async_copies: bool,
    pending: DashMap<u64, u32>,
    next_event: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
    copies: AtomicU64,
}

impl HostBackend {
    pub fn new(async_copies: bool) -> Self {
        Self {
            buffers: DashMap::new(),
            next_base: AtomicU64::new(1),
            async_copies,
            pending: DashMap::new(),
            next_event: AtomicU64::new(1),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            copies: AtomicU64::new(0),
        }
    }

    /// Buffer holding a copy of `bytes`, for registering application data
    pub fn allocate_from(&self, bytes: &[u8]) -> BufferAddr {
        let base = self.next_base.fetch_add(1, Ordering::Relaxed);
        self.buffers.insert(base, bytes.to_vec());
        BufferAddr::new(base)
    }

    /// Number of underlying allocations performed by the runtime
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    pub fn copy_count(&self) -> u64 {
        self.copies.load(Ordering::Relaxed)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(false)
    }
}

impl MemoryBackend for HostBackend {
    fn allocate(&self, node: NodeId, size: usize) -> Result<BufferAddr> {
        let base = self.next_base.fetch_add(1, Ordering::Relaxed);
        self.buffers.insert(base, vec![0u8; size]);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        trace!("Allocated {} bytes on node {} at base {}", size, node, base);
        Ok(BufferAddr::new(base))
    }

    fn free(&self, node: NodeId, addr: BufferAddr, size: usize) {
        if self.buffers.remove(&addr.base).is_none() {
            warn!("Freeing unknown buffer {:?} on node {}", addr, node);
            return;
        }
        self.frees.fetch_add(1, Ordering::Relaxed);
        trace!("Freed {} bytes on node {}", size, node);
    }

    fn copy(
        &self,
        _src_node: NodeId,
        src: BufferAddr,
        _dst_node: NodeId,
        dst: BufferAddr,
        size: usize,
    ) -> CopyStatus {
        // Read first: source and destination may live in the same shard
        let data: Option<Vec<u8>> = self
            .buffers
            .get(&src.base)
            .and_then(|buffer| buffer.get(src.offset..src.offset + size).map(<[u8]>::to_vec));
        match data {
            Some(data) => {
                if let Some(mut buffer) = self.buffers.get_mut(&dst.base) {
                    if let Some(target) = buffer.get_mut(dst.offset..dst.offset + size) {
                        target.copy_from_slice(&data);
                    }
                }
            }
            None => warn!("Copy from unknown buffer {:?}", src),
        }
        self.copies.fetch_add(1, Ordering::Relaxed);

        if self.async_copies {
            let event = self.next_event.fetch_add(1, Ordering::Relaxed);
            // Completes on the second poll
            self.pending.insert(event, 1);
            CopyStatus::Pending(AsyncEvent(event))
        } else {
            CopyStatus::Done
        }
    }

    fn test_completion(&self, event: AsyncEvent) -> bool {
        let done = match self.pending.get_mut(&event.0) {
            Some(mut remaining) => {
                if *remaining == 0 {
                    true
                } else {
                    *remaining -= 1;
                    false
                }
            }
            None => return true,
        };
        if done {
            self.pending.remove(&event.0);
        }
        done
    }

    fn with_bytes(&self, _node: NodeId, addr: BufferAddr, len: usize, f: &mut dyn FnMut(&mut [u8])) {
        match self.buffers.get_mut(&addr.base) {
            Some(mut buffer) => match buffer.get_mut(addr.offset..addr.offset + len) {
                Some(bytes) => f(bytes),
                None => warn!("Access past the end of buffer {:?}", addr),
            },
            None => warn!("Access to unknown buffer {:?}", addr),
        }
    }
}

/// Backend that refuses every allocation, for exercising failure paths
#[derive(Debug, Default)]
pub struct NullBackend;

impl MemoryBackend for NullBackend {
    fn allocate(&self, node: NodeId, size: usize) -> Result<BufferAddr> {
        Err(RuntimeError::OutOfMemory {
            node,
            requested: size,
        })
    }

    fn free(&self, _node: NodeId, _addr: BufferAddr, _size: usize) {}

    fn copy(&self, _: NodeId, _: BufferAddr, _: NodeId, _: BufferAddr, _: usize) -> CopyStatus {
        CopyStatus::Done
    }

    fn test_completion(&self, _event: AsyncEvent) -> bool {
        true
    }

    fn with_bytes(&self, _: NodeId, _: BufferAddr, _: usize, _: &mut dyn FnMut(&mut [u8])) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_between_buffers() {
        let backend = HostBackend::new(false);
        let src = backend.allocate_from(&[1, 2, 3, 4]);
        let dst = backend.allocate(NodeId(1), 4).unwrap();

        assert_eq!(backend.copy(NodeId(0), src, NodeId(1), dst, 4), CopyStatus::Done);
        let mut seen = Vec::new();
        backend.with_bytes(NodeId(1), dst, 4, &mut |bytes| seen = bytes.to_vec());
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(backend.allocation_count(), 1);
    }

    #[test]
    fn test_copy_with_offsets() {
        let backend = HostBackend::new(false);
        let src = backend.allocate_from(&[9, 8, 7, 6]);
        let dst = backend.allocate(NodeId(0), 4).unwrap();
        backend.copy(NodeId(0), src.at(2), NodeId(0), dst.at(1), 2);

        let mut seen = Vec::new();
        backend.with_bytes(NodeId(0), dst, 4, &mut |bytes| seen = bytes.to_vec());
        assert_eq!(seen, vec![0, 7, 6, 0]);
    }

    #[test]
    fn test_async_copy_completes_after_polling() {
        let backend = HostBackend::new(true);
        let src = backend.allocate_from(&[5; 8]);
        let dst = backend.allocate(NodeId(1), 8).unwrap();
        let status = backend.copy(NodeId(0), src, NodeId(1), dst, 8);
        let event = match status {
            CopyStatus::Pending(event) => event,
            CopyStatus::Done => panic!("expected a pending copy"),
        };
        assert!(!backend.test_completion(event));
        assert!(backend.test_completion(event));
    }

    #[test]
    fn test_free_removes_buffer() {
        let backend = HostBackend::default();
        let addr = backend.allocate(NodeId(0), 16).unwrap();
        assert_eq!(backend.live_buffers(), 1);
        backend.free(NodeId(0), addr, 16);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.free_count(), 1);
    }

    #[test]
    fn test_direct_copy_capability() {
        let backend = HostBackend::default();
        assert!(backend.can_copy_direct(NodeKind::CpuRam, NodeKind::CudaRam));
        assert!(!backend.can_copy_direct(NodeKind::CudaRam, NodeKind::Disk));
    }
}
