// src/task/codelet.rs
//! Codelets: kernels with one implementation per architecture

use crate::data::{AccessMode, DataLayout};
use crate::memory::{BufferAddr, MemoryBackend, NodeId};
use crate::perfmodel::PerfModel;
use crate::sched::{ArchKind, WorkerId};
use std::fmt;
use std::sync::Arc;

/// Kernel body
pub type KernelFn = Arc<dyn Fn(&KernelContext<'_>) + Send + Sync>;

/// One buffer handed to a kernel, in declaration order
#[derive(Debug, Clone)]
pub struct KernelBuffer {
    pub addr: BufferAddr,
    pub layout: DataLayout,
    pub mode: AccessMode,
}

/// Everything a kernel can see while it runs
pub struct KernelContext<'a> {
    pub worker: WorkerId,
    pub node: NodeId,
    pub buffers: &'a [KernelBuffer],
    pub(crate) backend: &'a dyn MemoryBackend,
}

impl KernelContext<'_> {
    /// Run `f` over the bytes of buffer `index`
    pub fn with_bytes_mut(&self, index: usize, f: &mut dyn FnMut(&mut [u8])) {
        let buffer = &self.buffers[index];
        self.backend
            .with_bytes(self.node, buffer.addr, buffer.layout.size(), f);
    }

    /// Read buffer `index` as little-endian `f64` values
    pub fn read_f64(&self, index: usize) -> Vec<f64> {
        let mut values = Vec::new();
        self.with_bytes_mut(index, &mut |bytes| {
            values = bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
        });
        values
    }

    /// Overwrite buffer `index` with little-endian `f64` values
    pub fn write_f64(&self, index: usize, values: &[f64]) {
        self.with_bytes_mut(index, &mut |bytes| {
            for (chunk, value) in bytes.chunks_exact_mut(8).zip(values) {
                chunk.copy_from_slice(&value.to_le_bytes());
            }
        });
    }
}

/// A kernel variant for one architecture
#[derive(Clone)]
pub struct Implementation {
    pub arch: ArchKind,
    pub func: KernelFn,
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementation").field("arch", &self.arch).finish()
    }
}

/// Kernel description shared by many tasks
#[derive(Debug, Clone)]
pub struct Codelet {
    pub name: String,

    pub implementations: Vec<Implementation>,

    /// Expected execution time and power, if modelled
    pub model: Option<Arc<dyn PerfModel>>,

    /// Declared number of buffers, checked at submission
    pub nbuffers: usize,
}

impl Codelet {
    pub fn new(name: impl Into<String>, nbuffers: usize) -> Self {
        Self {
            name: name.into(),
            implementations: Vec::new(),
            model: None,
            nbuffers,
        }
    }

    pub fn with_implementation<F>(mut self, arch: ArchKind, func: F) -> Self
    where
        F: Fn(&KernelContext<'_>) + Send + Sync + 'static,
    {
        self.implementations.push(Implementation {
            arch,
            func: Arc::new(func),
        });
        self
    }

    pub fn with_model(mut self, model: Arc<dyn PerfModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Whether implementation `index` runs on `arch`
    pub fn can_execute(&self, arch: ArchKind, index: usize) -> bool {
        self.implementations
            .get(index)
            .map(|implementation| implementation.arch == arch)
            .unwrap_or(false)
    }
}
