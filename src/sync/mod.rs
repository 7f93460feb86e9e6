// src/sync/mod.rs
//! Low-level mutual exclusion primitives

pub mod spinlock;

// Re-export commonly used types
pub use spinlock::{SpinLock, SpinLockGuard, SPIN_MAX_TRY};
