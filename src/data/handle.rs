// src/data/handle.rs
//! Data handles
//!
//! A handle is the runtime's identity for one piece of application data. Its
//! header holds everything the dependency engine, the coherency layer and
//! the allocator mutate, behind a single spin lock.

use crate::data::layout::{DataLayout, LayoutPiece};
use crate::data::mode::{AccessMode, MsiState};
use crate::data::replicate::{BufferOrigin, Replicate};
use crate::data::requester::DataRequester;
use crate::memory::{BufferAddr, NodeId};
use crate::sched::WorkerId;
use crate::sync::{SpinLock, SpinLockGuard, SPIN_MAX_TRY};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

/// Identity of a handle; also the total order used for lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutable state of a handle, protected by the header lock
#[derive(Debug)]
pub struct HandleHeader {
    /// Number of granted accessors
    pub refcnt: u32,

    /// Internal operations (transfers, allocations) in progress
    pub busy_count: u32,

    /// Mode of the granted accessors
    pub current_mode: AccessMode,

    /// Bumped on every write, lets in-flight copies detect stale sources
    pub version: u64,

    /// Requesters waiting for access, in arrival order
    pub req_list: VecDeque<DataRequester>,

    /// One replicate per memory node
    pub replicates: Vec<Replicate>,

    /// Private scratch / redux buffers
    pub per_worker: HashMap<WorkerId, Replicate>,

    /// Partition children, empty when the handle is not partitioned
    pub children: Vec<Arc<DataHandle>>,

    /// Nodes written through on every write access
    pub wt_mask: u64,

    /// Hint that evicting this data is cheap
    pub is_not_important: bool,

    pub unregistered: bool,
}

impl HandleHeader {
    pub fn replicate(&self, node: NodeId) -> &Replicate {
        &self.replicates[node.index()]
    }

    pub fn replicate_mut(&mut self, node: NodeId) -> &mut Replicate {
        &mut self.replicates[node.index()]
    }

    pub fn state(&self, node: NodeId) -> MsiState {
        self.replicates[node.index()].state
    }

    pub fn is_valid_on(&self, node: NodeId) -> bool {
        self.replicates[node.index()].is_valid()
    }

    pub fn valid_nodes(&self) -> Vec<NodeId> {
        self.replicates
            .iter()
            .filter(|r| r.is_valid())
            .map(|r| r.node)
            .collect()
    }

    pub fn owner(&self) -> Option<NodeId> {
        self.replicates
            .iter()
            .find(|r| r.state == MsiState::Owner)
            .map(|r| r.node)
    }

    pub fn is_partitioned(&self) -> bool {
        !self.children.is_empty()
    }

    /// Whether write-through is requested towards `node`
    pub fn writes_through_to(&self, node: NodeId) -> bool {
        node.index() < 64 && self.wt_mask & (1u64 << node.index()) != 0
    }

    /// Whether the replicates satisfy the MSI invariant: a single Owner
    /// with every other copy Invalid, or any number of Shared copies
    pub fn msi_consistent(&self) -> bool {
        let owners = self
            .replicates
            .iter()
            .filter(|r| r.state == MsiState::Owner)
            .count();
        let shared = self
            .replicates
            .iter()
            .filter(|r| r.state == MsiState::Shared)
            .count();
        owners <= 1 && !(owners == 1 && shared > 0)
    }
}

/// A registered piece of data
pub struct DataHandle {
    id: HandleId,
    home_node: Option<NodeId>,
    father: Option<Weak<DataHandle>>,
    /// Byte offset inside the root handle's buffer
    root_offset: usize,
    layout: DataLayout,
    header: SpinLock<HandleHeader>,
}

impl DataHandle {
    /// Register data living on `home_node`, or with no initial copy
    pub fn register(
        id: HandleId,
        layout: DataLayout,
        home: Option<(NodeId, BufferAddr)>,
        nnodes: usize,
    ) -> Arc<Self> {
        let mut replicates: Vec<Replicate> = (0..nnodes).map(|n| Replicate::new(NodeId(n))).collect();
        if let Some((node, buffer)) = home {
            let replicate = &mut replicates[node.index()];
            replicate.state = MsiState::Owner;
            replicate.install(buffer, BufferOrigin::Application);
        }

        Arc::new(Self {
            id,
            home_node: home.map(|(node, _)| node),
            father: None,
            root_offset: 0,
            layout,
            header: SpinLock::new(HandleHeader {
                refcnt: 0,
                busy_count: 0,
                current_mode: AccessMode::Read,
                version: 0,
                req_list: VecDeque::new(),
                replicates,
                per_worker: HashMap::new(),
                children: Vec::new(),
                wt_mask: 0,
                is_not_important: false,
                unregistered: false,
            }),
        })
    }

    /// Create a partition child inheriting the parent's per-node state
    pub(crate) fn new_child(
        id: HandleId,
        father: &Arc<DataHandle>,
        father_header: &HandleHeader,
        piece: &LayoutPiece,
    ) -> Arc<Self> {
        let replicates = father_header
            .replicates
            .iter()
            .map(|parent| {
                let mut replicate = Replicate::new(parent.node);
                replicate.state = parent.state;
                if let Some(buffer) = parent.buffer {
                    replicate.install(buffer.at(piece.offset), BufferOrigin::ParentView);
                }
                replicate
            })
            .collect();

        Arc::new(Self {
            id,
            home_node: father.home_node,
            father: Some(Arc::downgrade(father)),
            root_offset: father.root_offset + piece.offset,
            layout: piece.layout.clone(),
            header: SpinLock::new(HandleHeader {
                refcnt: 0,
                busy_count: 0,
                current_mode: AccessMode::Read,
                version: 0,
                req_list: VecDeque::new(),
                replicates,
                per_worker: HashMap::new(),
                children: Vec::new(),
                wt_mask: father_header.wt_mask,
                is_not_important: father_header.is_not_important,
                unregistered: false,
            }),
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn home_node(&self) -> Option<NodeId> {
        self.home_node
    }

    pub fn father(&self) -> Option<Arc<DataHandle>> {
        self.father.as_ref().and_then(Weak::upgrade)
    }

    pub fn root_offset(&self) -> usize {
        self.root_offset
    }

    /// Blocking acquire, for threads that own no pending transfers
    pub fn lock(&self) -> SpinLockGuard<'_, HandleHeader> {
        self.header.lock()
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, HandleHeader>> {
        self.header.try_lock()
    }

    /// Acquire while making progress on pending transfers between attempts
    pub fn lock_with_progress(&self, progress: &dyn Fn()) -> SpinLockGuard<'_, HandleHeader> {
        self.header.lock_with_progress(progress)
    }

    /// Acquire with a bounded number of progress attempts, then block
    pub fn lock_bounded(&self, progress: &dyn Fn()) -> SpinLockGuard<'_, HandleHeader> {
        self.header.lock_bounded(SPIN_MAX_TRY, progress)
    }

    /// Snapshot of the partition subtree rooted here, parent first
    pub fn subtree(self: &Arc<Self>) -> Vec<Arc<DataHandle>> {
        let mut nodes = vec![Arc::clone(self)];
        let mut next = 0;
        while next < nodes.len() {
            let children = nodes[next].lock().children.clone();
            nodes.extend(children);
            next += 1;
        }
        nodes
    }

    /// Like [`DataHandle::subtree`] but gives up on the first busy header
    pub fn try_subtree(self: &Arc<Self>) -> Option<Vec<Arc<DataHandle>>> {
        let mut nodes = vec![Arc::clone(self)];
        let mut next = 0;
        while next < nodes.len() {
            let children = nodes[next].try_lock()?.children.clone();
            nodes.extend(children);
            next += 1;
        }
        Some(nodes)
    }

    /// Set the write-through mask
    pub fn set_wt_mask(&self, mask: u64) {
        self.lock().wt_mask = mask;
    }

    /// Hint whether the data is worth keeping on accelerators
    pub fn advise_if_data_is_important(&self, important: bool) {
        let mut header = self.lock();
        header.is_not_important = !important;
        let children = header.children.clone();
        drop(header);
        for child in children {
            child.advise_if_data_is_important(important);
        }
    }

    /// Child `index` of a partitioned handle
    pub fn get_sub_data(&self, index: usize) -> Option<Arc<DataHandle>> {
        self.lock().children.get(index).cloned()
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataHandle")
            .field("id", &self.id)
            .field("home_node", &self.home_node)
            .field("root_offset", &self.root_offset)
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::layout::PartitionFilter;

    fn ram_vector(nx: usize) -> Arc<DataHandle> {
        DataHandle::register(
            HandleId(1),
            DataLayout::vector(nx, 4),
            Some((NodeId::MAIN_RAM, BufferAddr::new(100))),
            3,
        )
    }

    #[test]
    fn test_register_sets_home_owner() {
        let handle = ram_vector(16);
        let header = handle.lock();
        assert_eq!(header.state(NodeId(0)), MsiState::Owner);
        assert_eq!(header.state(NodeId(1)), MsiState::Invalid);
        assert!(header.replicate(NodeId(0)).allocated());
        assert!(!header.replicate(NodeId(0)).automatically_allocated());
        assert!(header.msi_consistent());
        assert_eq!(handle.home_node(), Some(NodeId::MAIN_RAM));
    }

    #[test]
    fn test_register_without_home() {
        let handle = DataHandle::register(HandleId(2), DataLayout::vector(4, 8), None, 2);
        let header = handle.lock();
        assert!(header.valid_nodes().is_empty());
        assert!(handle.home_node().is_none());
    }

    #[test]
    fn test_child_inherits_states_and_views() {
        let handle = ram_vector(16);
        let pieces = handle
            .layout()
            .partition(PartitionFilter::Block { nparts: 2 })
            .unwrap();
        let header = handle.lock();
        let child = DataHandle::new_child(HandleId(5), &handle, &header, &pieces[1]);
        drop(header);

        let child_header = child.lock();
        assert_eq!(child_header.state(NodeId(0)), MsiState::Owner);
        assert!(child_header.replicate(NodeId(0)).is_view());
        assert_eq!(
            child_header.replicate(NodeId(0)).buffer,
            Some(BufferAddr::new(100).at(32))
        );
        assert_eq!(child.root_offset(), 32);
        assert_eq!(child.father().unwrap().id(), HandleId(1));
    }

    #[test]
    fn test_msi_consistency_check() {
        let handle = ram_vector(4);
        let mut header = handle.lock();
        header.replicate_mut(NodeId(1)).state = MsiState::Shared;
        assert!(!header.msi_consistent());
        header.replicate_mut(NodeId(0)).state = MsiState::Shared;
        assert!(header.msi_consistent());
    }

    #[test]
    fn test_write_through_mask() {
        let handle = ram_vector(4);
        handle.set_wt_mask(0b10);
        let header = handle.lock();
        assert!(header.writes_through_to(NodeId(1)));
        assert!(!header.writes_through_to(NodeId(0)));
    }
}
