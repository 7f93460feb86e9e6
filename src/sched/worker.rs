// src/sched/worker.rs
//! Workers, architectures and the machine topology

use crate::memory::{MemoryNodes, NodeId, NodeKind};
use crate::perfmodel::PerfArch;
use crate::utils::config::TopologyConfig;
use bit_iter::BitIter;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

/// Index of a worker, in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl WorkerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Processing unit architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchKind {
    Cpu,
    Cuda,
    OpenCl,
    Mic,
}

impl ArchKind {
    /// Throughput relative to one CPU core
    pub fn relative_speedup(self) -> f64 {
        match self {
            ArchKind::Cpu => 1.0,
            ArchKind::Cuda => 13.33,
            ArchKind::OpenCl => 12.22,
            ArchKind::Mic => 1.0,
        }
    }

    /// Kind of the memory node a worker of this architecture computes on
    pub fn memory_kind(self) -> NodeKind {
        match self {
            ArchKind::Cpu => NodeKind::CpuRam,
            ArchKind::Cuda => NodeKind::CudaRam,
            ArchKind::OpenCl => NodeKind::OpenClRam,
            ArchKind::Mic => NodeKind::MicRam,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ArchKind::Cpu => "CPU",
            ArchKind::Cuda => "CUDA",
            ArchKind::OpenCl => "OpenCL",
            ArchKind::Mic => "MIC",
        }
    }
}

/// Description of one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescr {
    pub id: WorkerId,
    pub arch: ArchKind,
    /// Device index among workers of the same architecture
    pub devid: usize,
    /// Memory node the worker computes on
    pub memory_node: NodeId,
    pub name: String,
}

impl WorkerDescr {
    pub fn new(id: WorkerId, arch: ArchKind, devid: usize, memory_node: NodeId) -> Self {
        Self {
            id,
            arch,
            devid,
            memory_node,
            name: format!("{} {}", arch.label(), devid),
        }
    }

    pub fn perf_arch(&self) -> PerfArch {
        PerfArch {
            kind: self.arch,
            devid: self.devid,
        }
    }

    pub fn relative_speedup(&self) -> f64 {
        self.arch.relative_speedup()
    }
}

/// Set of workers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerMask {
    words: Vec<u64>,
}

impl WorkerMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, worker: WorkerId) {
        let (word, bit) = (worker.0 / 64, worker.0 % 64);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << bit;
    }

    pub fn remove(&mut self, worker: WorkerId) {
        if let Some(word) = self.words.get_mut(worker.0 / 64) {
            *word &= !(1u64 << (worker.0 % 64));
        }
    }

    pub fn contains(&self, worker: WorkerId) -> bool {
        self.words
            .get(worker.0 / 64)
            .is_some_and(|word| word & (1u64 << (worker.0 % 64)) != 0)
    }

    pub fn union_with(&mut self, other: &WorkerMask) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (word, other) in self.words.iter_mut().zip(&other.words) {
            *word |= other;
        }
    }

    pub fn intersects(&self, other: &WorkerMask) -> bool {
        self.words.iter().zip(&other.words).any(|(a, b)| a & b != 0)
    }

    /// Workers in increasing id order
    pub fn iter(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.words.iter().enumerate().flat_map(|(index, &word)| {
            BitIter::from(word).map(move |bit| WorkerId(index * 64 + bit))
        })
    }

    pub fn first(&self) -> Option<WorkerId> {
        self.iter().next()
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&word| word == 0)
    }
}

impl FromIterator<WorkerId> for WorkerMask {
    fn from_iter<I: IntoIterator<Item = WorkerId>>(iter: I) -> Self {
        let mut mask = WorkerMask::new();
        for worker in iter {
            mask.insert(worker);
        }
        mask
    }
}

/// Memory nodes and workers of the machine
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Arc<MemoryNodes>,
    workers: Vec<WorkerDescr>,
}

impl Topology {
    pub fn new(nodes: Arc<MemoryNodes>, workers: Vec<WorkerDescr>) -> Self {
        Self { nodes, workers }
    }

    /// CPU workers on main RAM, then one worker per device on its own node
    pub fn from_config(config: &TopologyConfig) -> Self {
        const MB: usize = 1 << 20;
        let mut nodes = MemoryNodes::new(config.cpu_memory_limit_mb.map(|mb| mb as usize * MB));
        let mut workers = Vec::new();

        for devid in 0..config.ncpus {
            let id = WorkerId(workers.len());
            workers.push(WorkerDescr::new(id, ArchKind::Cpu, devid, NodeId::MAIN_RAM));
        }
        let device_capacity = Some(config.device_memory_mb as usize * MB);
        for (arch, count) in [(ArchKind::Cuda, config.ncuda), (ArchKind::OpenCl, config.nopencl)] {
            for devid in 0..count {
                let node = nodes.register(arch.memory_kind(), device_capacity, false);
                let id = WorkerId(workers.len());
                workers.push(WorkerDescr::new(id, arch, devid, node));
            }
        }
        if let Some(mb) = config.disk_memory_mb {
            nodes.register(NodeKind::Disk, Some(mb as usize * MB), config.disk_no_reclaim);
        }

        Self::new(Arc::new(nodes), workers)
    }

    pub fn nodes(&self) -> &Arc<MemoryNodes> {
        &self.nodes
    }

    pub fn workers(&self) -> &[WorkerDescr] {
        &self.workers
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerDescr> {
        self.workers.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn all_workers(&self) -> WorkerMask {
        self.workers.iter().map(|worker| worker.id).collect()
    }

    /// Workers computing on `node`
    pub fn workers_on_node(&self, node: NodeId) -> impl Iterator<Item = &WorkerDescr> {
        self.workers
            .iter()
            .filter(move |worker| worker.memory_node == node)
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Worker driven by the calling thread, if any
pub fn current_worker() -> Option<WorkerId> {
    CURRENT_WORKER.with(Cell::get)
}

/// Bind the calling thread to `worker`, for threads driving a worker
pub fn set_current_worker(worker: Option<WorkerId>) {
    CURRENT_WORKER.with(|current| current.set(worker));
}
