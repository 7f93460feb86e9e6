// src/perfmodel/transfer.rs
//! Predicted copy time between memory nodes

use crate::memory::{MemoryNodes, NodeId, NodeKind};
use serde::{Deserialize, Serialize};

/// Latency and bandwidth of one link
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkCost {
    pub latency_us: f64,
    /// Bytes per microsecond
    pub bandwidth: f64,
}

impl LinkCost {
    pub fn time(&self, size: usize) -> f64 {
        self.latency_us + size as f64 / self.bandwidth
    }
}

/// Copy time predictions for every pair of nodes
#[derive(Debug, Clone)]
pub struct TransferModel {
    nnodes: usize,
    links: Vec<Option<LinkCost>>,
}

fn default_link(kind: NodeKind) -> LinkCost {
    match kind {
        NodeKind::CpuRam => LinkCost {
            latency_us: 0.0,
            bandwidth: f64::INFINITY,
        },
        NodeKind::CudaRam | NodeKind::OpenClRam | NodeKind::MicRam => LinkCost {
            latency_us: 10.0,
            bandwidth: 8000.0,
        },
        NodeKind::Disk => LinkCost {
            latency_us: 100.0,
            bandwidth: 200.0,
        },
    }
}

impl TransferModel {
    /// Default costs: every device talks to main RAM over its own link and
    /// device-to-device copies go through main RAM
    pub fn from_nodes(nodes: &MemoryNodes) -> Self {
        let nnodes = nodes.count();
        let mut links = vec![None; nnodes * nnodes];
        for src in nodes.iter() {
            for dst in nodes.iter() {
                if src.id == dst.id {
                    continue;
                }
                let link = if src.id == NodeId::MAIN_RAM {
                    default_link(dst.kind)
                } else if dst.id == NodeId::MAIN_RAM {
                    default_link(src.kind)
                } else {
                    let up = default_link(src.kind);
                    let down = default_link(dst.kind);
                    LinkCost {
                        latency_us: up.latency_us + down.latency_us,
                        bandwidth: 1.0 / (1.0 / up.bandwidth + 1.0 / down.bandwidth),
                    }
                };
                links[src.id.index() * nnodes + dst.id.index()] = Some(link);
            }
        }
        Self { nnodes, links }
    }

    pub fn set_link(&mut self, src: NodeId, dst: NodeId, cost: LinkCost) {
        self.links[src.index() * self.nnodes + dst.index()] = Some(cost);
    }

    /// Predicted time in microseconds to copy `size` bytes
    pub fn predict(&self, src: NodeId, dst: NodeId, size: usize) -> f64 {
        if src == dst {
            return 0.0;
        }
        self.links[src.index() * self.nnodes + dst.index()]
            .map(|link| link.time(size))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_costs() {
        let mut nodes = MemoryNodes::new(None);
        let gpu0 = nodes.register(NodeKind::CudaRam, Some(1 << 30), false);
        let gpu1 = nodes.register(NodeKind::CudaRam, Some(1 << 30), false);
        let model = TransferModel::from_nodes(&nodes);

        assert_eq!(model.predict(NodeId::MAIN_RAM, NodeId::MAIN_RAM, 1 << 20), 0.0);
        assert_eq!(model.predict(NodeId::MAIN_RAM, gpu0, 8000), 11.0);
        assert_eq!(model.predict(gpu0, NodeId::MAIN_RAM, 8000), 11.0);
        // Through main RAM: two latencies, half the bandwidth
        assert!((model.predict(gpu0, gpu1, 8000) - 22.0).abs() < 1e-9);
    }

    #[test]
    fn test_override_link() {
        let mut nodes = MemoryNodes::new(None);
        let disk = nodes.register(NodeKind::Disk, None, false);
        let mut model = TransferModel::from_nodes(&nodes);
        model.set_link(
            disk,
            NodeId::MAIN_RAM,
            LinkCost {
                latency_us: 1.0,
                bandwidth: 1.0,
            },
        );
        assert_eq!(model.predict(disk, NodeId::MAIN_RAM, 9), 10.0);
    }
}
