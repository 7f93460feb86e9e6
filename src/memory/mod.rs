// src/memory/mod.rs
//! Memory nodes, buffers and the allocator

pub mod backend;
pub mod manager;
pub mod memalloc;
pub mod node;

pub use backend::{AsyncEvent, BufferAddr, CopyStatus, HostBackend, MemoryBackend, NullBackend};
pub use manager::MemoryManager;
pub use memalloc::{AllocatorStats, ChunkId, MemChunk, MemoryAllocator, ReplicateSlot};
pub use node::{MemoryNodeDescr, MemoryNodes, NodeId, NodeKind};
