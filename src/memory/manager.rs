// src/memory/manager.rs
//! Per-node capacity accounting

use crate::memory::{MemoryNodes, NodeId};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
struct NodeUsage {
    total: Option<usize>,
    used: AtomicUsize,
}

/// Tracks how much of each node's memory is handed out
#[derive(Debug)]
pub struct MemoryManager {
    nodes: Vec<NodeUsage>,
}

impl MemoryManager {
    pub fn new(nodes: &MemoryNodes) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|node| NodeUsage {
                    total: node.capacity,
                    used: AtomicUsize::new(0),
                })
                .collect(),
        }
    }

    /// Reserve `size` bytes, failing if the node would exceed its capacity
    pub fn try_reserve(&self, node: NodeId, size: usize) -> bool {
        let usage = &self.nodes[node.index()];
        let Some(total) = usage.total else {
            usage.used.fetch_add(size, Ordering::AcqRel);
            return true;
        };
        usage
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&after| after <= total)
            })
            .is_ok()
    }

    pub fn release(&self, node: NodeId, size: usize) {
        let usage = &self.nodes[node.index()];
        let previous = usage.used.fetch_sub(size, Ordering::AcqRel);
        debug_assert!(previous >= size, "released more memory than reserved");
    }

    /// Whether `size` bytes would fit right now
    pub fn test_allocate_size(&self, node: NodeId, size: usize) -> bool {
        match self.nodes[node.index()].total {
            Some(total) => self.used(node) + size <= total,
            None => true,
        }
    }

    pub fn total(&self, node: NodeId) -> Option<usize> {
        self.nodes[node.index()].total
    }

    pub fn used(&self, node: NodeId) -> usize {
        self.nodes[node.index()].used.load(Ordering::Acquire)
    }

    pub fn available(&self, node: NodeId) -> Option<usize> {
        self.total(node)
            .map(|total| total.saturating_sub(self.used(node)))
    }

    pub fn is_limited(&self, node: NodeId) -> bool {
        self.nodes[node.index()].total.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::NodeKind;

    #[test]
    fn test_reserve_within_capacity() {
        let mut nodes = MemoryNodes::new(None);
        let gpu = nodes.register(NodeKind::CudaRam, Some(100), false);
        let manager = MemoryManager::new(&nodes);

        assert!(manager.try_reserve(gpu, 40));
        assert!(manager.try_reserve(gpu, 40));
        assert!(!manager.try_reserve(gpu, 40));
        assert_eq!(manager.available(gpu), Some(20));
        assert!(manager.test_allocate_size(gpu, 20));
        assert!(!manager.test_allocate_size(gpu, 21));

        manager.release(gpu, 40);
        assert!(manager.try_reserve(gpu, 40));
    }

    #[test]
    fn test_unlimited_node() {
        let nodes = MemoryNodes::new(None);
        let manager = MemoryManager::new(&nodes);
        assert!(manager.try_reserve(NodeId::MAIN_RAM, usize::MAX / 2));
        assert!(!manager.is_limited(NodeId::MAIN_RAM));
        assert_eq!(manager.available(NodeId::MAIN_RAM), None);
    }
}
