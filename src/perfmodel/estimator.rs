// src/perfmodel/estimator.rs
//! Predictions consumed by scheduling policies

use crate::data::{DataHandle, MsiState};
use crate::memory::NodeId;
use crate::perfmodel::{LengthEstimate, TransferModel};
use crate::sched::WorkerDescr;
use crate::task::Task;
use std::sync::Arc;

/// Expected execution time, energy and transfer time of tasks
pub trait Estimator: Send + Sync {
    fn expected_length(&self, task: &Task, worker: &WorkerDescr, implementation: usize) -> LengthEstimate;

    fn expected_power(&self, _task: &Task, _worker: &WorkerDescr, _implementation: usize) -> Option<f64> {
        None
    }

    /// Time to make `handle` valid on `node`
    fn expected_handle_transfer_time(&self, handle: &Arc<DataHandle>, node: NodeId) -> f64;

    /// Time to bring every input of `task` to `node`
    fn expected_transfer_time(&self, task: &Task, node: NodeId) -> f64 {
        task.ordered_buffers()
            .iter()
            .filter(|buffer| buffer.mode.reads())
            .map(|buffer| self.expected_handle_transfer_time(&buffer.handle, node))
            .sum()
    }
}

/// Estimator backed by the codelets' models and a transfer model
#[derive(Debug, Clone)]
pub struct ModelEstimator {
    transfer: TransferModel,
}

impl ModelEstimator {
    pub fn new(transfer: TransferModel) -> Self {
        Self { transfer }
    }

    pub fn transfer_model(&self) -> &TransferModel {
        &self.transfer
    }
}

impl Estimator for ModelEstimator {
    fn expected_length(&self, task: &Task, worker: &WorkerDescr, implementation: usize) -> LengthEstimate {
        match task.codelet().and_then(|codelet| codelet.model.as_ref()) {
            Some(model) => model.expected_length(task, worker.perf_arch(), implementation),
            None => LengthEstimate::NoModel,
        }
    }

    fn expected_power(&self, task: &Task, worker: &WorkerDescr, implementation: usize) -> Option<f64> {
        task.codelet()
            .and_then(|codelet| codelet.model.as_ref())
            .and_then(|model| model.expected_power(task, worker.perf_arch(), implementation))
    }

    fn expected_handle_transfer_time(&self, handle: &Arc<DataHandle>, node: NodeId) -> f64 {
        let header = handle.lock();
        if header.is_valid_on(node) {
            return 0.0;
        }
        // Prefer the owner, then the cheapest shared copy
        let source = header.owner().or_else(|| {
            header
                .replicates
                .iter()
                .filter(|r| r.state == MsiState::Shared)
                .map(|r| r.node)
                .min_by(|a, b| {
                    self.transfer
                        .predict(*a, node, handle.size())
                        .total_cmp(&self.transfer.predict(*b, node, handle.size()))
                })
        });
        drop(header);
        match source {
            Some(src) => self.transfer.predict(src, node, handle.size()),
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AccessMode, DataLayout, HandleId};
    use crate::memory::{BufferAddr, MemoryNodes, NodeKind};
    use crate::perfmodel::FixedModel;
    use crate::sched::{ArchKind, WorkerId};
    use crate::task::Codelet;

    #[test]
    fn test_transfer_time_counts_missing_inputs() {
        let mut nodes = MemoryNodes::new(None);
        let gpu = nodes.register(NodeKind::CudaRam, Some(1 << 30), false);
        let estimator = ModelEstimator::new(TransferModel::from_nodes(&nodes));

        let input = DataHandle::register(
            HandleId(1),
            DataLayout::vector(1000, 8),
            Some((NodeId::MAIN_RAM, BufferAddr::new(1))),
            2,
        );
        let output = DataHandle::register(HandleId(2), DataLayout::vector(1000, 8), None, 2);
        let task = Task::control()
            .buffer(&input, AccessMode::Read)
            .buffer(&output, AccessMode::Write)
            .build();

        assert_eq!(estimator.expected_transfer_time(&task, NodeId::MAIN_RAM), 0.0);
        assert_eq!(estimator.expected_transfer_time(&task, gpu), 11.0);
    }

    #[test]
    fn test_length_comes_from_codelet_model() {
        let nodes = MemoryNodes::new(None);
        let estimator = ModelEstimator::new(TransferModel::from_nodes(&nodes));
        let cpu = WorkerDescr::new(WorkerId(0), ArchKind::Cpu, 0, NodeId::MAIN_RAM);

        let modelled = Arc::new(
            Codelet::new("scal", 0)
                .with_implementation(ArchKind::Cpu, |_| {})
                .with_model(Arc::new(FixedModel::new().with_length(ArchKind::Cpu, 42.0))),
        );
        let plain = Arc::new(Codelet::new("noop", 0).with_implementation(ArchKind::Cpu, |_| {}));

        let t1 = Task::builder(modelled).build();
        let t2 = Task::builder(plain).build();
        assert_eq!(estimator.expected_length(&t1, &cpu, 0), LengthEstimate::Calibrated(42.0));
        assert_eq!(estimator.expected_length(&t2, &cpu, 0), LengthEstimate::NoModel);
    }
}
