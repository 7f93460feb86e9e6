// src/data/subtree.rs
//! All-or-nothing locking of a partition subtree
//!
//! Eviction must see a consistent view of a handle and every partition
//! child that may alias its buffer. Headers are try-locked parent first;
//! on the first failure everything acquired so far is released and the
//! caller moves on to another candidate.

use crate::data::handle::{DataHandle, HandleHeader};
use crate::memory::NodeId;
use crate::sync::SpinLockGuard;
use std::sync::Arc;

/// Locked headers of a subtree, released in reverse order on drop
pub struct SubtreeGuard<'a> {
    entries: Vec<(&'a Arc<DataHandle>, SpinLockGuard<'a, HandleHeader>)>,
}

impl<'a> SubtreeGuard<'a> {
    /// Try-lock every handle of a snapshot taken with
    /// [`DataHandle::try_subtree`]
    ///
    /// Fails if any header is busy or if the partition changed since the
    /// snapshot was taken.
    pub fn try_lock_all(nodes: &'a [Arc<DataHandle>]) -> Option<Self> {
        let mut guard = SubtreeGuard {
            entries: Vec::with_capacity(nodes.len()),
        };
        for handle in nodes {
            let header = handle.try_lock()?;
            guard.entries.push((handle, header));
        }
        if guard.matches_snapshot() {
            Some(guard)
        } else {
            None
        }
    }

    fn matches_snapshot(&self) -> bool {
        let nchildren: usize = self.entries.iter().map(|(_, h)| h.children.len()).sum();
        if nchildren + 1 != self.entries.len() {
            return false;
        }
        self.entries.iter().all(|(_, header)| {
            header.children.iter().all(|child| {
                self.entries
                    .iter()
                    .any(|(handle, _)| Arc::ptr_eq(handle, child))
            })
        })
    }

    pub fn root(&self) -> &HandleHeader {
        &self.entries[0].1
    }

    pub fn root_mut(&mut self) -> &mut HandleHeader {
        &mut self.entries[0].1
    }

    pub fn root_handle(&self) -> &Arc<DataHandle> {
        self.entries[0].0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<DataHandle>, &HandleHeader)> {
        self.entries.iter().map(|(handle, header)| (*handle, &**header))
    }

    pub fn iter_mut(&mut self) -> Box<dyn Iterator<Item = (&Arc<DataHandle>, &mut HandleHeader)> + '_> {
        Box::new(
            self.entries
                .iter_mut()
                .map(|(handle, header)| (*handle, &mut **header)),
        )
    }

    /// Position of each entry's father inside the guard
    pub fn father_positions(&self) -> Vec<Option<usize>> {
        self.entries
            .iter()
            .map(|(handle, _)| {
                let father = handle.father()?;
                self.entries
                    .iter()
                    .position(|(h, _)| Arc::ptr_eq(h, &father))
            })
            .collect()
    }

    /// For each entry, whether its replicate on `node` lives inside the
    /// root's buffer (the root itself, or a chain of views down from it)
    pub fn backed_by_root(&self, node: NodeId) -> Vec<bool> {
        let fathers = self.father_positions();
        let mut backed = Vec::with_capacity(self.entries.len());
        for (i, (_, header)) in self.entries.iter().enumerate() {
            let replicate = header.replicate(node);
            let value = if i == 0 {
                replicate.allocated()
            } else {
                replicate.is_view() && fathers[i].map_or(false, |pos| backed[pos])
            };
            backed.push(value);
        }
        backed
    }

    /// No accessor or transfer pins a replicate on `node` anywhere in the
    /// subtree
    pub fn may_free(&self, node: NodeId) -> bool {
        self.entries.iter().all(|(_, header)| {
            header.replicate(node).refcnt == 0 && header.replicate(node).request.is_none()
        })
    }
}

impl Drop for SubtreeGuard<'_> {
    fn drop(&mut self) {
        while let Some(entry) = self.entries.pop() {
            drop(entry);
        }
    }
}
