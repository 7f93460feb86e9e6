// src/lib.rs
//! Taskweave: a task runtime for heterogeneous machines
//!
//! Applications register data, describe tasks as kernels over
//! (handle, access mode) pairs and submit them. The runtime orders tasks by
//! their data accesses, keeps copies of the data coherent across memory
//! nodes and places ready tasks on workers through pluggable policies.
//!
//! # Architecture
//!
//! The library is structured into these modules:
//!
//! - **data**: handles, per-node replicates, layouts and access modes
//! - **deps**: the data dependency engine granting accesses in order
//! - **memory**: memory nodes, the allocator with its reclaim engine and
//!   the driver boundary
//! - **request**: per-node data request lists
//! - **coherency**: MSI coherency, fetch/release and partitioning
//! - **sched**: workers, scheduling contexts, policies and the component tree
//! - **perfmodel**: execution time and transfer time estimates
//! - **task**: tasks, codelets and bundles
//! - **runtime**: worker threads and the application facade
//! - **observability**: logging, metrics and performance counters
//! - **sync**: the spin lock guarding handle headers
//! - **utils**: errors, configuration and time keeping

// Public module exports
pub mod coherency;
pub mod data;
pub mod deps;
pub mod memory;
pub mod observability;
pub mod perfmodel;
pub mod request;
pub mod runtime;
pub mod sched;
pub mod sync;
pub mod task;
pub mod utils;

// Re-export commonly used types
pub use data::{AccessMode, DataHandle, DataLayout};
pub use runtime::{Runtime, RuntimeStats};
pub use task::{Codelet, Task, TaskRef};
pub use utils::config::RuntimeConfig;
pub use utils::errors::{Result, RuntimeError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Runtime build information
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.rustc_version.is_empty());
    }
}
