// src/memory/node.rs
//! Memory node registry
//!
//! Nodes are registered once at start-up. Node 0 is always main RAM.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a memory node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    pub const MAIN_RAM: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of memory behind a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    CpuRam,
    CudaRam,
    OpenClRam,
    MicRam,
    Disk,
}

impl NodeKind {
    pub fn label(self) -> &'static str {
        match self {
            NodeKind::CpuRam => "RAM",
            NodeKind::CudaRam => "CUDA",
            NodeKind::OpenClRam => "OpenCL",
            NodeKind::MicRam => "MIC",
            NodeKind::Disk => "Disk",
        }
    }
}

/// Description of one memory node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNodeDescr {
    pub id: NodeId,

    pub kind: NodeKind,

    /// Device index among nodes of the same kind
    pub devid: usize,

    /// Capacity in bytes, `None` when unlimited
    pub capacity: Option<usize>,

    /// Data must never be evicted to this node
    pub no_reclaim: bool,
}

impl MemoryNodeDescr {
    pub fn name(&self) -> String {
        format!("{} {}", self.kind.label(), self.devid)
    }
}

/// All memory nodes of the machine
#[derive(Debug, Clone)]
pub struct MemoryNodes {
    nodes: Vec<MemoryNodeDescr>,
}

impl MemoryNodes {
    /// Registry holding only main RAM
    pub fn new(ram_capacity: Option<usize>) -> Self {
        Self {
            nodes: vec![MemoryNodeDescr {
                id: NodeId::MAIN_RAM,
                kind: NodeKind::CpuRam,
                devid: 0,
                capacity: ram_capacity,
                no_reclaim: false,
            }],
        }
    }

    /// Register a new node and return its id
    pub fn register(&mut self, kind: NodeKind, capacity: Option<usize>, no_reclaim: bool) -> NodeId {
        let id = NodeId(self.nodes.len());
        let devid = self.nodes.iter().filter(|n| n.kind == kind).count();
        self.nodes.push(MemoryNodeDescr {
            id,
            kind,
            devid,
            capacity,
            no_reclaim,
        });
        id
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, node: NodeId) -> &MemoryNodeDescr {
        &self.nodes[node.0]
    }

    pub fn kind(&self, node: NodeId) -> NodeKind {
        self.nodes[node.0].kind
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|n| n.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryNodeDescr> {
        self.nodes.iter()
    }

    pub fn name(&self, node: NodeId) -> String {
        self.nodes[node.0].name()
    }
}
