// src/memory/memalloc.rs
//! Buffer allocation, caching and reclaim
//!
//! Every buffer the runtime allocates is tracked by a [`MemChunk`] in its
//! node's LRU list. When a handle lets go of a buffer the chunk goes into a
//! per-node cache keyed by layout footprint, and the next allocation with
//! the same shape reuses it. When an allocation fails the allocator first
//! flushes the cache, then evicts chunks still attached to handles, writing
//! their contents back to another node when they hold the only valid copy.
//!
//! Lock order is handle header, then the node's chunk lock. Eviction only
//! ever try-locks handle headers.

use crate::data::{
    BufferOrigin, DataHandle, DataLayout, Footprint, HandleHeader, MsiState, RelaxedCoherency,
    Replicate, SubtreeGuard,
};
use crate::memory::{BufferAddr, CopyStatus, MemoryBackend, MemoryManager, MemoryNodes, NodeId, NodeKind};
use crate::observability::PerfCounters;
use crate::sched::WorkerId;
use crate::sync::SpinLock;
use crate::utils::config::MemoryConfig;
use crate::utils::errors::{Result, RuntimeError};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Identity of a tracked allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mc{}", self.0)
    }
}

/// Which replicate of the owning handle a chunk backs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicateSlot {
    Node,
    Worker(WorkerId),
}

/// Bookkeeping record of one runtime-allocated buffer
#[derive(Debug, Clone)]
pub struct MemChunk {
    pub id: ChunkId,
    pub node: NodeId,
    /// `None` while the chunk sits in the cache
    pub owner: Option<(Weak<DataHandle>, ReplicateSlot)>,
    pub footprint: Footprint,
    pub size: usize,
    pub layout: DataLayout,
    pub buffer: BufferAddr,
    pub relaxed_coherency: RelaxedCoherency,
}

#[derive(Debug, Default)]
struct NodeChunks {
    /// Attached chunks, least recently used first
    mc_list: VecDeque<MemChunk>,
    cache: HashMap<Footprint, Vec<MemChunk>>,
    cache_nb: usize,
    cache_size: usize,
}

#[derive(Debug, Default)]
struct StatCounters {
    allocations: AtomicU64,
    cache_hits: AtomicU64,
    chunks_freed: AtomicU64,
    reclaims: AtomicU64,
    reclaimed_bytes: AtomicU64,
}

/// Snapshot of allocator activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    pub allocations: u64,
    pub cache_hits: u64,
    pub chunks_freed: u64,
    pub reclaims: u64,
    pub reclaimed_bytes: u64,
}

/// Allocator for all memory nodes
pub struct MemoryAllocator {
    nodes: Arc<MemoryNodes>,
    manager: MemoryManager,
    backend: Arc<dyn MemoryBackend>,
    chunks: Vec<SpinLock<NodeChunks>>,
    config: MemoryConfig,
    next_chunk: AtomicU64,
    warned: Vec<AtomicBool>,
    tidy_warned: Vec<AtomicBool>,
    counters: Arc<dyn PerfCounters>,
    stats: StatCounters,
}

impl MemoryAllocator {
    pub fn new(
        nodes: Arc<MemoryNodes>,
        backend: Arc<dyn MemoryBackend>,
        config: MemoryConfig,
        counters: Arc<dyn PerfCounters>,
    ) -> Self {
        let manager = MemoryManager::new(&nodes);
        let chunks = (0..nodes.count()).map(|_| SpinLock::default()).collect();
        let warned = (0..nodes.count()).map(|_| AtomicBool::new(false)).collect();
        let tidy_warned = (0..nodes.count()).map(|_| AtomicBool::new(false)).collect();
        Self {
            nodes,
            manager,
            backend,
            chunks,
            config,
            next_chunk: AtomicU64::new(1),
            warned,
            tidy_warned,
            counters,
            stats: StatCounters::default(),
        }
    }

    pub fn nodes(&self) -> &Arc<MemoryNodes> {
        &self.nodes
    }

    pub fn manager(&self) -> &MemoryManager {
        &self.manager
    }

    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    pub fn counters(&self) -> &Arc<dyn PerfCounters> {
        &self.counters
    }

    /// Make sure `handle` has a buffer on `node`
    ///
    /// The header is not held during the raw allocation; the replicate is
    /// pinned instead and a buffer allocated concurrently by someone else
    /// wins. Prefetches never evict data in use, they only flush the cache.
    pub fn allocate_memory_on_node(
        &self,
        handle: &Arc<DataHandle>,
        node: NodeId,
        is_prefetch: bool,
        progress: &dyn Fn(),
    ) -> Result<()> {
        {
            let mut header = handle.lock_bounded(progress);
            if header.replicate(node).allocated() {
                return Ok(());
            }
            if let Some(chunk) = self.take_cached(node, handle.layout()) {
                let buffer = chunk.buffer;
                let id = self.attach(chunk, handle, ReplicateSlot::Node, RelaxedCoherency::None);
                header
                    .replicate_mut(node)
                    .install(buffer, BufferOrigin::Runtime(id));
                return Ok(());
            }
            header.replicate_mut(node).refcnt += 1;
            header.busy_count += 1;
        }

        let size = handle.size();
        let allocated = self.allocate_with_reclaim(node, size, is_prefetch);

        let mut header = handle.lock_bounded(progress);
        header.replicate_mut(node).refcnt -= 1;
        header.busy_count -= 1;
        let buffer = allocated?;
        if header.replicate(node).allocated() {
            drop(header);
            trace!("Handle {} got a buffer on node {} meanwhile", handle.id(), node);
            self.release_buffer(node, buffer, size);
            return Ok(());
        }
        let chunk = self.new_chunk(node, handle, ReplicateSlot::Node, buffer, RelaxedCoherency::None);
        let id = self.track(chunk);
        header
            .replicate_mut(node)
            .install(buffer, BufferOrigin::Runtime(id));
        Ok(())
    }

    /// Private scratch or redux buffer of `worker` on `node`
    pub fn allocate_private(
        &self,
        handle: &Arc<DataHandle>,
        worker: WorkerId,
        node: NodeId,
        relaxed: RelaxedCoherency,
        progress: &dyn Fn(),
    ) -> Result<BufferAddr> {
        if let Some(buffer) = handle
            .lock_bounded(progress)
            .per_worker
            .get(&worker)
            .and_then(|replicate| replicate.buffer)
        {
            return Ok(buffer);
        }

        let slot = ReplicateSlot::Worker(worker);
        let chunk = match self.take_cached(node, handle.layout()) {
            Some(mut chunk) => {
                chunk.owner = Some((Arc::downgrade(handle), slot));
                chunk.relaxed_coherency = relaxed;
                chunk
            }
            None => {
                let buffer = self.allocate_with_reclaim(node, handle.size(), false)?;
                self.new_chunk(node, handle, slot, buffer, relaxed)
            }
        };

        let mut header = handle.lock_bounded(progress);
        if let Some(existing) = header.per_worker.get(&worker).and_then(|r| r.buffer) {
            drop(header);
            self.release_buffer(node, chunk.buffer, chunk.size);
            return Ok(existing);
        }
        let buffer = chunk.buffer;
        let id = self.track(chunk);
        let mut replicate = Replicate::new(node);
        replicate.state = MsiState::Owner;
        replicate.relaxed_coherency = relaxed;
        replicate.install(buffer, BufferOrigin::Runtime(id));
        header.per_worker.insert(worker, replicate);
        Ok(buffer)
    }

    /// Detach the buffer of a replicate and keep it for reuse when possible
    ///
    /// Must be called with the handle's header held. Views are detached,
    /// application buffers are left alone.
    pub fn request_mem_chunk_removal(
        &self,
        handle: &DataHandle,
        header: &mut HandleHeader,
        node: NodeId,
        slot: ReplicateSlot,
    ) {
        let replicate = match slot {
            ReplicateSlot::Node => Some(header.replicate_mut(node)),
            ReplicateSlot::Worker(worker) => header.per_worker.get_mut(&worker),
        };
        let Some(replicate) = replicate else {
            return;
        };
        let Some(id) = replicate.chunk() else {
            if replicate.is_view() {
                replicate.detach();
            }
            return;
        };
        replicate.detach();
        if let ReplicateSlot::Worker(worker) = slot {
            header.per_worker.remove(&worker);
        }

        let Some(mut chunk) = self.remove_from_list(node, id) else {
            warn!("Chunk {} of handle {} is not tracked on node {}", id, handle.id(), node);
            return;
        };
        if !handle.layout().cacheable() || !self.caching_enabled(node) {
            self.release_buffer(node, chunk.buffer, chunk.size);
            return;
        }
        chunk.owner = None;
        let mut chunks = self.chunks[node.index()].lock();
        chunks.cache_nb += 1;
        chunks.cache_size += chunk.size;
        chunks.cache.entry(chunk.footprint).or_default().push(chunk);
    }

    /// Free cached chunks until `reclaim` bytes are released, or all of
    /// them when `reclaim` is `None`
    pub fn flush_memchunk_cache(&self, node: NodeId, reclaim: Option<usize>) -> usize {
        let mut victims = Vec::new();
        let mut freed = 0;
        {
            let mut chunks = self.chunks[node.index()].lock();
            let footprints: Vec<Footprint> = chunks.cache.keys().copied().collect();
            'flush: for footprint in footprints {
                while let Some(chunk) = chunks.cache.get_mut(&footprint).and_then(Vec::pop) {
                    chunks.cache_nb -= 1;
                    chunks.cache_size -= chunk.size;
                    freed += chunk.size;
                    victims.push(chunk);
                    if reclaim.is_some_and(|target| freed >= target) {
                        break 'flush;
                    }
                }
            }
            chunks.cache.retain(|_, list| !list.is_empty());
        }

        for chunk in victims {
            self.release_buffer(node, chunk.buffer, chunk.size);
            self.stats.chunks_freed.fetch_add(1, Ordering::Relaxed);
        }
        freed
    }

    /// Release memory on `node`: first the cache, then chunks in use in
    /// LRU order
    ///
    /// `reclaim == 0` means everything. Without `force` a zero request does
    /// nothing; with `force` chunks are freed even when no other node can
    /// take their data.
    pub fn memory_reclaim_generic(&self, node: NodeId, force: bool, reclaim: usize) -> usize {
        if reclaim == 0 && !force {
            return 0;
        }
        let target = (reclaim > 0).then_some(reclaim);
        if !force && !self.warned[node.index()].swap(true, Ordering::Relaxed) {
            warn!(
                "Not enough memory left on {}, reclaiming {} bytes from cached and unused buffers",
                self.nodes.name(node),
                reclaim
            );
        }

        let mut freed = self.flush_memchunk_cache(node, target);
        if target.map_or(true, |target| freed < target) {
            freed += self.free_potentially_in_use_mc(node, force, target.map(|target| target - freed));
        }

        debug!("Reclaimed {} bytes on {}", freed, self.nodes.name(node));
        self.stats.reclaims.fetch_add(1, Ordering::Relaxed);
        self.stats
            .reclaimed_bytes
            .fetch_add(freed as u64, Ordering::Relaxed);
        self.counters.notify_memory_reclaim(node, freed);
        freed
    }

    /// Free every runtime allocated buffer on `node`, used at shutdown
    pub fn free_all_automatically_allocated_buffers(&self, node: NodeId) -> usize {
        self.memory_reclaim_generic(node, true, 0)
    }

    /// Move a chunk to the most recently used end of its list
    pub fn memchunk_recently_used(&self, node: NodeId, id: ChunkId) {
        let mut chunks = self.chunks[node.index()].lock();
        if let Some(pos) = chunks.mc_list.iter().position(|chunk| chunk.id == id) {
            if let Some(chunk) = chunks.mc_list.remove(pos) {
                chunks.mc_list.push_back(chunk);
            }
        }
    }

    /// Reclaim ahead of time when free memory drops under the configured
    /// minimum, up to the configured target
    ///
    /// Cached chunks count as available and are left in the cache.
    pub fn memchunk_tidy(&self, node: NodeId) -> usize {
        let Some(total) = self.manager.total(node) else {
            return 0;
        };
        let cache_size = self.chunks[node.index()].lock().cache_size;
        let available = self.manager.available(node).unwrap_or(0) + cache_size;
        let minimum = total * usize::from(self.config.minimum_available_pct) / 100;
        if available >= minimum {
            return 0;
        }
        let target = total * usize::from(self.config.target_available_pct) / 100;
        let amount = target.saturating_sub(available);
        if !self.tidy_warned[node.index()].swap(true, Ordering::Relaxed) {
            warn!(
                "Low memory left on {} ({} of {} bytes available), purging {} bytes",
                self.nodes.name(node),
                available,
                total,
                amount
            );
        }
        debug!(
            "Tidying {}: {} bytes available, aiming for {}",
            self.nodes.name(node),
            available,
            target
        );
        self.free_potentially_in_use_mc(node, false, Some(amount))
    }

    /// Number of chunks attached to handles on `node`
    pub fn chunk_count(&self, node: NodeId) -> usize {
        self.chunks[node.index()].lock().mc_list.len()
    }

    /// Number and total size of cached chunks on `node`
    pub fn cached(&self, node: NodeId) -> (usize, usize) {
        let chunks = self.chunks[node.index()].lock();
        (chunks.cache_nb, chunks.cache_size)
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocations: self.stats.allocations.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            chunks_freed: self.stats.chunks_freed.load(Ordering::Relaxed),
            reclaims: self.stats.reclaims.load(Ordering::Relaxed),
            reclaimed_bytes: self.stats.reclaimed_bytes.load(Ordering::Relaxed),
        }
    }

    fn caching_enabled(&self, node: NodeId) -> bool {
        !(self.nodes.kind(node) == NodeKind::CpuRam && !self.manager.is_limited(node))
    }

    fn raw_allocate(&self, node: NodeId, size: usize) -> Result<BufferAddr> {
        if !self.manager.try_reserve(node, size) {
            return Err(RuntimeError::OutOfMemory {
                node,
                requested: size,
            });
        }
        match self.backend.allocate(node, size) {
            Ok(buffer) => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                self.counters.notify_allocation(node, size);
                Ok(buffer)
            }
            Err(err) => {
                self.manager.release(node, size);
                Err(err)
            }
        }
    }

    fn allocate_with_reclaim(&self, node: NodeId, size: usize, is_prefetch: bool) -> Result<BufferAddr> {
        let mut attempt = 0;
        loop {
            match self.raw_allocate(node, size) {
                Ok(buffer) => return Ok(buffer),
                Err(err) if attempt >= self.config.max_alloc_retries => return Err(err),
                Err(_) => {
                    attempt += 1;
                    let total = self.manager.total(node).unwrap_or(0);
                    let amount = ((self.config.reclaim_fraction * total as f64) as usize)
                        .max((self.config.size_coefficient * size as f64) as usize);
                    if is_prefetch {
                        self.flush_memchunk_cache(node, Some(amount));
                    } else {
                        self.memory_reclaim_generic(node, false, amount);
                    }
                }
            }
        }
    }

    fn release_buffer(&self, node: NodeId, buffer: BufferAddr, size: usize) {
        self.backend.free(node, buffer, size);
        self.manager.release(node, size);
    }

    fn take_cached(&self, node: NodeId, layout: &DataLayout) -> Option<MemChunk> {
        if !layout.cacheable() {
            return None;
        }
        let footprint = layout.footprint();
        let mut chunks = self.chunks[node.index()].lock();
        let list = chunks.cache.get_mut(&footprint)?;
        let pos = list.iter().position(|chunk| chunk.layout.same_shape(layout))?;
        let chunk = list.swap_remove(pos);
        chunks.cache_nb -= 1;
        chunks.cache_size -= chunk.size;
        drop(chunks);

        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.counters.notify_allocation_cache_hit(node);
        Some(chunk)
    }

    fn new_chunk(
        &self,
        node: NodeId,
        handle: &Arc<DataHandle>,
        slot: ReplicateSlot,
        buffer: BufferAddr,
        relaxed_coherency: RelaxedCoherency,
    ) -> MemChunk {
        MemChunk {
            id: ChunkId(self.next_chunk.fetch_add(1, Ordering::Relaxed)),
            node,
            owner: Some((Arc::downgrade(handle), slot)),
            footprint: handle.layout().footprint(),
            size: handle.size(),
            layout: handle.layout().clone(),
            buffer,
            relaxed_coherency,
        }
    }

    /// Hand a cached chunk to a new owner
    fn attach(
        &self,
        mut chunk: MemChunk,
        handle: &Arc<DataHandle>,
        slot: ReplicateSlot,
        relaxed_coherency: RelaxedCoherency,
    ) -> ChunkId {
        chunk.owner = Some((Arc::downgrade(handle), slot));
        chunk.relaxed_coherency = relaxed_coherency;
        self.track(chunk)
    }

    fn track(&self, chunk: MemChunk) -> ChunkId {
        let id = chunk.id;
        self.chunks[chunk.node.index()].lock().mc_list.push_back(chunk);
        id
    }

    fn remove_from_list(&self, node: NodeId, id: ChunkId) -> Option<MemChunk> {
        let mut chunks = self.chunks[node.index()].lock();
        let pos = chunks.mc_list.iter().position(|chunk| chunk.id == id)?;
        chunks.mc_list.remove(pos)
    }

    fn free_potentially_in_use_mc(&self, node: NodeId, force: bool, reclaim: Option<usize>) -> usize {
        let candidates: Vec<(ChunkId, Weak<DataHandle>, ReplicateSlot)> = {
            let chunks = self.chunks[node.index()].lock();
            chunks
                .mc_list
                .iter()
                .filter_map(|chunk| {
                    chunk
                        .owner
                        .as_ref()
                        .map(|(owner, slot)| (chunk.id, owner.clone(), *slot))
                })
                .collect()
        };

        let mut freed = 0;
        for (id, owner, slot) in candidates {
            if reclaim.is_some_and(|target| freed >= target) {
                break;
            }
            match owner.upgrade() {
                Some(handle) => freed += self.try_to_free_mem_chunk(node, id, &handle, slot, force),
                // Leaked by a handle dropped without unregistering
                None if force => {
                    if let Some(chunk) = self.remove_from_list(node, id) {
                        self.release_buffer(node, chunk.buffer, chunk.size);
                        freed += chunk.size;
                    }
                }
                None => {}
            }
        }
        freed
    }

    fn try_to_free_mem_chunk(
        &self,
        node: NodeId,
        id: ChunkId,
        handle: &Arc<DataHandle>,
        slot: ReplicateSlot,
        force: bool,
    ) -> usize {
        if let ReplicateSlot::Worker(worker) = slot {
            let Some(mut header) = handle.try_lock() else {
                return 0;
            };
            let Some(replicate) = header.per_worker.get(&worker) else {
                return 0;
            };
            if replicate.chunk() != Some(id) || replicate.refcnt > 0 {
                return 0;
            }
            if replicate.relaxed_coherency == RelaxedCoherency::Redux && !force {
                return 0;
            }
            header.per_worker.remove(&worker);
            drop(header);
            return self.free_tracked(node, id);
        }

        if !force && handle.home_node() == Some(node) {
            return 0;
        }
        let Some(nodes) = handle.try_subtree() else {
            return 0;
        };
        let Some(mut guard) = SubtreeGuard::try_lock_all(&nodes) else {
            return 0;
        };
        if guard.root().replicate(node).chunk() != Some(id) {
            return 0;
        }
        if !force && guard.root().writes_through_to(node) {
            return 0;
        }
        if !guard.may_free(node) {
            return 0;
        }

        let backed = guard.backed_by_root(node);
        let holds_valid_data = guard
            .iter()
            .zip(&backed)
            .any(|((_, header), &backed)| backed && header.is_valid_on(node));
        if holds_valid_data {
            match self.choose_target(&guard, node) {
                Some(target) => {
                    if !self.transfer_subtree_to_node(&mut guard, &backed, node, target) {
                        return 0;
                    }
                }
                None if force => {
                    warn!("Dropping the only valid copy of handle {} on {}", handle.id(), self.nodes.name(node));
                }
                None => return 0,
            }
        }
        self.do_free_mem_chunk(&mut guard, &backed, node, id)
    }

    /// Where to write back data evicted from `node`
    fn choose_target(&self, guard: &SubtreeGuard<'_>, node: NodeId) -> Option<NodeId> {
        let handle = guard.root_handle();
        let size = handle.size();
        let ram_fits = || {
            guard.root().replicate(NodeId::MAIN_RAM).allocated()
                || self.manager.test_allocate_size(NodeId::MAIN_RAM, size)
        };
        let target = match handle.home_node() {
            Some(home) if self.nodes.kind(home) == NodeKind::Disk && node != NodeId::MAIN_RAM => {
                if ram_fits() {
                    Some(NodeId::MAIN_RAM)
                } else {
                    self.better_disk(size, node)
                }
            }
            Some(home) => Some(home),
            None if node == NodeId::MAIN_RAM => self.better_disk(size, node),
            None if ram_fits() => Some(NodeId::MAIN_RAM),
            None => self.better_disk(size, node),
        };
        target.filter(|&target| {
            target != node && !(self.nodes.kind(target) == NodeKind::Disk && self.nodes.get(target).no_reclaim)
        })
    }

    /// Disk node with the most room for `size` bytes
    fn better_disk(&self, size: usize, node: NodeId) -> Option<NodeId> {
        self.nodes
            .iter()
            .filter(|descr| descr.kind == NodeKind::Disk && descr.id != node)
            .filter(|descr| self.manager.test_allocate_size(descr.id, size))
            .max_by_key(|descr| self.manager.available(descr.id).unwrap_or(usize::MAX))
            .map(|descr| descr.id)
    }

    /// Move the coherency state of everything backed by the root's buffer
    /// on `src` over to `dst`, copying the contents that are only on `src`
    fn transfer_subtree_to_node(
        &self,
        guard: &mut SubtreeGuard<'_>,
        backed: &[bool],
        src: NodeId,
        dst: NodeId,
    ) -> bool {
        let needs_buffer = guard.iter().zip(backed).any(|((_, header), &backed)| {
            backed
                && header.children.is_empty()
                && header.state(src) == MsiState::Owner
                && !header.replicate(dst).allocated()
        });
        if needs_buffer && !self.ensure_subtree_allocated(guard, dst) {
            return false;
        }

        for ((handle, header), &backed) in guard.iter_mut().zip(backed) {
            if !backed {
                continue;
            }
            match header.state(src) {
                MsiState::Owner => {
                    if header.children.is_empty() {
                        let (Some(from), Some(to)) =
                            (header.replicate(src).buffer, header.replicate(dst).buffer)
                        else {
                            warn!("No destination buffer for handle {} on node {}", handle.id(), dst);
                            continue;
                        };
                        self.copy_sync(src, from, dst, to, handle.size());
                        header.replicate_mut(dst).state = MsiState::Owner;
                    } else if header.replicate(dst).allocated() {
                        header.replicate_mut(dst).state = MsiState::Owner;
                    }
                    header.replicate_mut(src).state = MsiState::Invalid;
                }
                MsiState::Shared => {
                    header.replicate_mut(src).state = MsiState::Invalid;
                    let sharers: Vec<NodeId> = header
                        .replicates
                        .iter()
                        .filter(|replicate| replicate.state == MsiState::Shared)
                        .map(|replicate| replicate.node)
                        .collect();
                    if let [last] = sharers.as_slice() {
                        header.replicate_mut(*last).state = MsiState::Owner;
                    }
                }
                MsiState::Invalid => {}
            }
        }
        true
    }

    /// Give the root a buffer on `dst` and let unallocated descendants view
    /// into their father's buffer
    ///
    /// Only the cache of `dst` is flushed on failure; eviction never
    /// cascades.
    fn ensure_subtree_allocated(&self, guard: &mut SubtreeGuard<'_>, dst: NodeId) -> bool {
        let root = Arc::clone(guard.root_handle());
        if !guard.root().replicate(dst).allocated() {
            let chunk = match self.take_cached(dst, root.layout()) {
                Some(mut chunk) => {
                    chunk.owner = Some((Arc::downgrade(&root), ReplicateSlot::Node));
                    chunk.relaxed_coherency = RelaxedCoherency::None;
                    chunk
                }
                None => {
                    let size = root.size();
                    let buffer = match self.raw_allocate(dst, size) {
                        Ok(buffer) => buffer,
                        Err(_) => {
                            self.flush_memchunk_cache(dst, Some(size));
                            match self.raw_allocate(dst, size) {
                                Ok(buffer) => buffer,
                                Err(_) => return false,
                            }
                        }
                    };
                    self.new_chunk(dst, &root, ReplicateSlot::Node, buffer, RelaxedCoherency::None)
                }
            };
            let buffer = chunk.buffer;
            let id = self.track(chunk);
            guard
                .root_mut()
                .replicate_mut(dst)
                .install(buffer, BufferOrigin::Runtime(id));
        }

        let fathers = guard.father_positions();
        let offsets: Vec<usize> = guard.iter().map(|(handle, _)| handle.root_offset()).collect();
        let mut buffers: Vec<Option<BufferAddr>> =
            guard.iter().map(|(_, header)| header.replicate(dst).buffer).collect();
        let mut views = vec![false; buffers.len()];
        for i in 1..buffers.len() {
            if buffers[i].is_some() {
                continue;
            }
            if let Some(father) = fathers[i] {
                if let Some(father_buffer) = buffers[father] {
                    buffers[i] = Some(father_buffer.at(offsets[i] - offsets[father]));
                    views[i] = true;
                }
            }
        }
        for (i, (_, header)) in guard.iter_mut().enumerate() {
            if let (true, Some(buffer)) = (views[i], buffers[i]) {
                header
                    .replicate_mut(dst)
                    .install(buffer, BufferOrigin::ParentView);
            }
        }
        true
    }

    fn copy_sync(&self, src: NodeId, from: BufferAddr, dst: NodeId, to: BufferAddr, size: usize) {
        if let CopyStatus::Pending(event) = self.backend.copy(src, from, dst, to, size) {
            self.backend.wait_completion(event);
        }
        self.counters.notify_transfer(src, dst, size);
    }

    fn do_free_mem_chunk(&self, guard: &mut SubtreeGuard<'_>, backed: &[bool], node: NodeId, id: ChunkId) -> usize {
        for ((_, header), &backed) in guard.iter_mut().zip(backed).skip(1) {
            if backed {
                header.replicate_mut(node).detach();
            }
        }
        guard.root_mut().replicate_mut(node).detach();
        self.free_tracked(node, id)
    }

    fn free_tracked(&self, node: NodeId, id: ChunkId) -> usize {
        match self.remove_from_list(node, id) {
            Some(chunk) => {
                self.release_buffer(node, chunk.buffer, chunk.size);
                self.stats.chunks_freed.fetch_add(1, Ordering::Relaxed);
                trace!("Freed chunk {} ({} bytes) on node {}", id, chunk.size, node);
                chunk.size
            }
            None => 0,
        }
    }
}

impl fmt::Debug for MemoryAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("nodes", &self.nodes.count())
            .field("stats", &self.stats())
            .finish()
    }
}
