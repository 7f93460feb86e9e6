// src/perfmodel/mod.rs
//! Performance model queries
//!
//! Policies only query models; they never build them. This module defines
//! the query interface and two models:
//!
//! - **History**: running mean per (footprint, architecture, implementation),
//!   fed with measured execution times
//! - **Fixed**: constant per-architecture lengths, for known kernels
//!
//! plus the transfer model predicting copy times between memory nodes and
//! the [`Estimator`] combining both for schedulers.

pub mod estimator;
pub mod history;
pub mod transfer;

// Re-export commonly used types
pub use estimator::{Estimator, ModelEstimator};
pub use history::{FixedModel, HistoryModel};
pub use transfer::TransferModel;

use crate::sched::ArchKind;
use crate::task::Task;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Architecture a prediction is made for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerfArch {
    pub kind: ArchKind,
    pub devid: usize,
}

/// Outcome of a length query
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LengthEstimate {
    /// Expected execution time in microseconds
    Calibrated(f64),
    /// A model exists but has not seen enough samples
    Uncalibrated,
    /// The codelet carries no model
    NoModel,
}

impl LengthEstimate {
    pub fn value(self) -> Option<f64> {
        match self {
            LengthEstimate::Calibrated(length) => Some(length),
            _ => None,
        }
    }

    pub fn is_calibrated(self) -> bool {
        matches!(self, LengthEstimate::Calibrated(_))
    }
}

/// Per-codelet predictor of execution time and energy
pub trait PerfModel: Send + Sync + fmt::Debug {
    fn expected_length(&self, task: &Task, arch: PerfArch, implementation: usize) -> LengthEstimate;

    /// Expected energy in joules
    fn expected_power(&self, _task: &Task, _arch: PerfArch, _implementation: usize) -> Option<f64> {
        None
    }

    /// Record a measured execution time in microseconds
    fn feed(&self, _task: &Task, _arch: PerfArch, _implementation: usize, _measured_us: f64) {}
}
