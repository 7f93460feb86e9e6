// src/perfmodel/history.rs
//! History-based and fixed performance models

use crate::data::Footprint;
use crate::perfmodel::{LengthEstimate, PerfArch, PerfModel};
use crate::sched::ArchKind;
use crate::task::Task;
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HistoryKey {
    footprint: Footprint,
    arch: ArchKind,
    implementation: usize,
}

/// Running statistics of one history entry
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryEntry {
    pub samples: u32,
    pub mean: f64,
    m2: f64,
}

impl HistoryEntry {
    fn push(&mut self, value: f64) {
        self.samples += 1;
        let delta = value - self.mean;
        self.mean += delta / f64::from(self.samples);
        self.m2 += delta * (value - self.mean);
    }

    pub fn deviation(&self) -> f64 {
        if self.samples < 2 {
            0.0
        } else {
            (self.m2 / f64::from(self.samples - 1)).sqrt()
        }
    }
}

/// Mean execution time per task footprint, architecture and implementation
#[derive(Debug)]
pub struct HistoryModel {
    symbol: String,
    min_samples: u32,
    entries: DashMap<HistoryKey, HistoryEntry>,
}

impl HistoryModel {
    pub fn new(symbol: impl Into<String>, min_samples: u32) -> Self {
        Self {
            symbol: symbol.into(),
            min_samples: min_samples.max(1),
            entries: DashMap::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn entry(&self, footprint: Footprint, arch: ArchKind, implementation: usize) -> Option<HistoryEntry> {
        self.entries
            .get(&HistoryKey {
                footprint,
                arch,
                implementation,
            })
            .map(|entry| *entry)
    }
}

impl PerfModel for HistoryModel {
    fn expected_length(&self, task: &Task, arch: PerfArch, implementation: usize) -> LengthEstimate {
        match self.entry(task.footprint(), arch.kind, implementation) {
            Some(entry) if entry.samples >= self.min_samples => LengthEstimate::Calibrated(entry.mean),
            _ => LengthEstimate::Uncalibrated,
        }
    }

    fn feed(&self, task: &Task, arch: PerfArch, implementation: usize, measured_us: f64) {
        let key = HistoryKey {
            footprint: task.footprint(),
            arch: arch.kind,
            implementation,
        };
        let mut entry = self.entries.entry(key).or_default();
        entry.push(measured_us);
        if entry.samples == self.min_samples {
            debug!(
                "Model {} calibrated for {:?} footprint {}: {:.1}us",
                self.symbol, arch.kind, key.footprint, entry.mean
            );
        }
    }
}

/// Constant length per architecture; other architectures are uncalibrated
#[derive(Debug, Clone, Default)]
pub struct FixedModel {
    lengths: HashMap<ArchKind, f64>,
    power: HashMap<ArchKind, f64>,
}

impl FixedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_length(mut self, arch: ArchKind, length_us: f64) -> Self {
        self.lengths.insert(arch, length_us);
        self
    }

    pub fn with_power(mut self, arch: ArchKind, joules: f64) -> Self {
        self.power.insert(arch, joules);
        self
    }
}

impl PerfModel for FixedModel {
    fn expected_length(&self, _task: &Task, arch: PerfArch, _implementation: usize) -> LengthEstimate {
        match self.lengths.get(&arch.kind) {
            Some(length) => LengthEstimate::Calibrated(*length),
            None => LengthEstimate::Uncalibrated,
        }
    }

    fn expected_power(&self, _task: &Task, arch: PerfArch, _implementation: usize) -> Option<f64> {
        self.power.get(&arch.kind).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu() -> PerfArch {
        PerfArch {
            kind: ArchKind::Cpu,
            devid: 0,
        }
    }

    #[test]
    fn test_history_calibrates_after_min_samples() {
        let model = HistoryModel::new("axpy", 3);
        let task = Task::control().build();

        assert_eq!(model.expected_length(&task, cpu(), 0), LengthEstimate::Uncalibrated);
        model.feed(&task, cpu(), 0, 10.0);
        model.feed(&task, cpu(), 0, 20.0);
        assert_eq!(model.expected_length(&task, cpu(), 0), LengthEstimate::Uncalibrated);
        model.feed(&task, cpu(), 0, 30.0);
        assert_eq!(model.expected_length(&task, cpu(), 0), LengthEstimate::Calibrated(20.0));

        let entry = model.entry(task.footprint(), ArchKind::Cpu, 0).unwrap();
        assert!((entry.deviation() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_keys_by_arch() {
        let model = HistoryModel::new("gemm", 1);
        let task = Task::control().build();
        model.feed(&task, cpu(), 0, 5.0);
        let gpu = PerfArch {
            kind: ArchKind::Cuda,
            devid: 0,
        };
        assert_eq!(model.expected_length(&task, gpu, 0), LengthEstimate::Uncalibrated);
    }

    #[test]
    fn test_fixed_model() {
        let model = FixedModel::new()
            .with_length(ArchKind::Cpu, 10.0)
            .with_power(ArchKind::Cpu, 3.0);
        let task = Task::control().build();
        assert_eq!(model.expected_length(&task, cpu(), 0), LengthEstimate::Calibrated(10.0));
        assert_eq!(model.expected_power(&task, cpu(), 0), Some(3.0));
    }
}
