// src/utils/config.rs
//! Runtime configuration
//!
//! Values are layered in this order, later sources winning:
//!
//! 1. Built-in defaults ([`RuntimeConfig::default`])
//! 2. An optional `taskweave.toml` in the working directory
//! 3. Environment variables prefixed with `TASKWEAVE_`, sections separated
//!    by a double underscore (`TASKWEAVE_SCHED__ALPHA=2.0`)

use crate::utils::errors::{Result, RuntimeError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Policy names accepted by `sched.policy`
pub const KNOWN_POLICIES: &[&str] = &[
    "eager",
    "prio",
    "random",
    "ws",
    "heft",
    "dm",
    "dmda",
    "dmdas",
    "dmdar",
    "modular-eager",
    "modular-prio",
    "modular-random",
    "modular-random-prio",
    "modular-ws",
    "modular-heft",
];

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub topology: TopologyConfig,
    pub sched: SchedConfig,
    pub memory: MemoryConfig,
    pub workers: WorkerConfig,
    pub observability: ObservabilityConfig,
}

/// Machine description used to build workers and memory nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Number of CPU workers (all attached to main RAM)
    pub ncpus: usize,

    /// Number of CUDA devices, each with its own memory node
    pub ncuda: usize,

    /// Number of OpenCL devices, each with its own memory node
    pub nopencl: usize,

    /// Main RAM limit in MiB (unlimited when unset)
    pub cpu_memory_limit_mb: Option<u64>,

    /// Memory of each accelerator node in MiB
    pub device_memory_mb: u64,

    /// Capacity of an optional disk node in MiB
    pub disk_memory_mb: Option<u64>,

    /// Never evict data to the disk node
    pub disk_no_reclaim: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            ncpus: 4,
            ncuda: 0,
            nopencl: 0,
            cpu_memory_limit_mb: None,
            device_memory_mb: 256,
            disk_memory_mb: None,
            disk_no_reclaim: false,
        }
    }
}

/// Scheduling policy parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    /// Policy of the initial scheduling context
    pub policy: String,

    /// Weight of the completion time term
    pub alpha: f64,

    /// Weight of the data transfer term
    pub beta: f64,

    /// Weight of the energy term
    pub gamma: f64,

    /// Idle power of the whole machine in watts
    pub idle_power: f64,

    /// Prefetch task inputs as soon as a worker is chosen
    pub prefetch: bool,

    /// Queue length above which a component stops accepting tasks
    /// (policy default when unset)
    pub ntasks_threshold: Option<usize>,

    /// Expected queue length in microseconds above which a component stops
    /// accepting tasks
    pub exp_len_threshold: f64,

    /// Seed for randomized policies (entropy when unset)
    pub seed: Option<u64>,

    /// Samples needed before a history model is considered calibrated
    pub calibration_samples: u32,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            policy: "dmda".to_string(),
            alpha: 1.0,
            beta: 1.0,
            gamma: 1000.0,
            idle_power: 0.0,
            prefetch: true,
            ntasks_threshold: None,
            exp_len_threshold: 1e9,
            seed: None,
            calibration_samples: 10,
        }
    }
}

/// Allocation and reclaim parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Reclaim at least this many times the requested size on ENOMEM
    pub size_coefficient: f64,

    /// Reclaim at least this fraction of the node on ENOMEM
    pub reclaim_fraction: f64,

    /// Allocation retries after a reclaim
    pub max_alloc_retries: u32,

    /// Tidy the node when less than this percentage is available
    pub minimum_available_pct: u8,

    /// Tidy down until this percentage is available
    pub target_available_pct: u8,

    /// Let the host backend complete copies asynchronously
    pub async_copies: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            size_coefficient: 2.0,
            reclaim_fraction: 0.25,
            max_alloc_retries: 2,
            minimum_available_pct: 5,
            target_available_pct: 10,
            async_copies: false,
        }
    }
}

/// Worker thread behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Idle workers block on a condition variable instead of spinning
    pub allow_sleep: bool,

    /// Maximum sleep before polling data requests again
    pub idle_timeout_us: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            allow_sleep: true,
            idle_timeout_us: 1000,
        }
    }
}

/// Logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,

    /// Emit JSON formatted logs
    pub json_logs: bool,

    /// Install the Prometheus recorder
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics: true,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from `taskweave.toml` and the environment
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("taskweave").required(false))
            .add_source(Self::environment())
            .build()?;
        let config: RuntimeConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit file, still honouring the environment
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Self::environment())
            .build()?;
        let config: RuntimeConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn environment() -> Environment {
        Environment::with_prefix("TASKWEAVE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.topology.ncpus + self.topology.ncuda + self.topology.nopencl == 0 {
            return Err(RuntimeError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }
        if !KNOWN_POLICIES.contains(&self.sched.policy.as_str()) {
            return Err(RuntimeError::UnknownPolicy(self.sched.policy.clone()));
        }
        if self.memory.minimum_available_pct > self.memory.target_available_pct
            || self.memory.target_available_pct > 100
        {
            return Err(RuntimeError::InvalidConfig(format!(
                "memory percentages must satisfy minimum ({}) <= target ({}) <= 100",
                self.memory.minimum_available_pct, self.memory.target_available_pct
            )));
        }
        if self.memory.size_coefficient <= 0.0 || self.memory.reclaim_fraction < 0.0 {
            return Err(RuntimeError::InvalidConfig(
                "reclaim coefficients must be positive".to_string(),
            ));
        }
        if self.sched.alpha < 0.0 || self.sched.beta < 0.0 || self.sched.gamma < 0.0 {
            return Err(RuntimeError::InvalidConfig(
                "alpha, beta and gamma must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Queue threshold for a policy, falling back to the policy default
    pub fn ntasks_threshold_for(&self, policy: &str) -> usize {
        self.sched.ntasks_threshold.unwrap_or(match policy {
            "modular-random" | "modular-random-prio" => 2,
            _ => 30,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sched.alpha, 1.0);
        assert_eq!(config.sched.gamma, 1000.0);
        assert_eq!(config.memory.max_alloc_retries, 2);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let mut config = RuntimeConfig::default();
        config.sched.policy = "fastest".to_string();
        assert!(matches!(
            config.validate(),
            Err(RuntimeError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn test_percentages_checked() {
        let mut config = RuntimeConfig::default();
        config.memory.minimum_available_pct = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.ntasks_threshold_for("modular-random"), 2);
        assert_eq!(config.ntasks_threshold_for("modular-heft"), 30);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[sched]\npolicy = \"heft\"\nbeta = 3.5\n\n[topology]\nncpus = 2\nncuda = 1"
        )
        .unwrap();

        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.sched.policy, "heft");
        assert_eq!(config.sched.beta, 3.5);
        assert_eq!(config.topology.ncpus, 2);
        assert_eq!(config.topology.ncuda, 1);
        // Untouched sections keep their defaults
        assert_eq!(config.memory.target_available_pct, 10);
    }
}
