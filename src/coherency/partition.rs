// src/coherency/partition.rs
//! Partitioning a handle into contiguous children and gathering them back

use crate::coherency::msi::collapse_states;
use crate::coherency::DataEngine;
use crate::data::{AccessMode, BufferOrigin, DataHandle, PartitionFilter};
use crate::memory::{BufferAddr, CopyStatus, NodeId, ReplicateSlot};
use crate::utils::errors::{Result, RuntimeError};
use std::sync::Arc;
use tracing::debug;

impl DataEngine {
    /// Cut `handle` into children
    ///
    /// Children inherit the father's per-node states and view into its
    /// buffers. The father may not be accessed until unpartitioned.
    pub fn partition(&self, handle: &Arc<DataHandle>, filter: PartitionFilter) -> Result<Vec<Arc<DataHandle>>> {
        let pieces = handle.layout().partition(filter)?;
        let mut header = handle.lock();
        if header.is_partitioned() {
            return Err(RuntimeError::Partitioned(handle.id()));
        }
        let in_flight = header.replicates.iter().any(|r| r.request.is_some());
        if header.refcnt > 0 || header.busy_count > 0 || !header.req_list.is_empty() || in_flight {
            return Err(RuntimeError::HandleBusy(handle.id()));
        }
        let children: Vec<Arc<DataHandle>> = pieces
            .iter()
            .map(|piece| DataHandle::new_child(self.next_handle_id(), handle, &header, piece))
            .collect();
        header.children = children.clone();
        debug!(handle = %handle.id(), nparts = children.len(), "Partitioned data");
        Ok(children)
    }

    /// Gather the children of `handle` on `gathering_node` and drop them
    ///
    /// The father ends up valid on every node where its buffer holds the
    /// data of every child.
    pub fn unpartition(&self, handle: &Arc<DataHandle>, gathering_node: NodeId) -> Result<()> {
        let children = handle.lock().children.clone();
        if children.is_empty() {
            return Ok(());
        }
        for child in &children {
            let header = child.lock();
            let in_flight = header.replicates.iter().any(|r| r.request.is_some());
            if header.refcnt > 0 || !header.req_list.is_empty() || in_flight {
                return Err(RuntimeError::HandleBusy(child.id()));
            }
        }

        self.allocator
            .allocate_memory_on_node(handle, gathering_node, false, &|| {
                self.requests.progress(gathering_node, false);
            })?;
        let father_buffer = handle
            .lock()
            .replicate(gathering_node)
            .buffer
            .ok_or(RuntimeError::OutOfMemory {
                node: gathering_node,
                requested: handle.size(),
            })?;

        for child in &children {
            if child.lock().is_partitioned() {
                self.unpartition(child, gathering_node)?;
            }
            self.move_into_father_view(child, gathering_node, father_buffer.at(child.root_offset() - handle.root_offset()));
            self.fetch_data_on_node(child, gathering_node, AccessMode::Read, true)?;
        }

        let nodes: Vec<NodeId> = self.nodes().ids().collect();
        let father_allocated: Vec<bool> = {
            let header = handle.lock();
            nodes.iter().map(|&node| header.replicate(node).allocated()).collect()
        };
        let mut valid = father_allocated;
        for child in &children {
            let mut header = child.lock();
            for (i, &node) in nodes.iter().enumerate() {
                let replicate = header.replicate(node);
                valid[i] &= replicate.is_valid() && replicate.is_view();
                if replicate.automatically_allocated() {
                    self.allocator
                        .request_mem_chunk_removal(child, &mut header, node, ReplicateSlot::Node);
                } else if replicate.is_view() {
                    header.replicate_mut(node).detach();
                }
            }
            header.unregistered = true;
        }

        let mut header = handle.lock();
        for (node, state) in nodes.iter().zip(collapse_states(&valid)) {
            header.replicate_mut(*node).state = state;
        }
        header.version += 1;
        header.children.clear();
        debug!(handle = %handle.id(), node = %gathering_node, "Unpartitioned data");
        Ok(())
    }

    /// Make the child's replicate on `node` a view into the father,
    /// carrying over contents already valid in a buffer of its own
    fn move_into_father_view(&self, child: &Arc<DataHandle>, node: NodeId, view: BufferAddr) {
        let mut header = child.lock();
        let replicate = header.replicate(node);
        if replicate.is_view() && replicate.buffer == Some(view) {
            return;
        }
        let state = replicate.state;
        if let (true, Some(own)) = (replicate.is_valid(), replicate.buffer) {
            if let CopyStatus::Pending(event) =
                self.allocator.backend().copy(node, own, node, view, child.size())
            {
                self.allocator.backend().wait_completion(event);
            }
        }
        if header.replicate(node).automatically_allocated() {
            self.allocator
                .request_mem_chunk_removal(child, &mut header, node, ReplicateSlot::Node);
        }
        let replicate = header.replicate_mut(node);
        replicate.install(view, BufferOrigin::ParentView);
        replicate.state = state;
    }
}
