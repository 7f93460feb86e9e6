// src/utils/timing.rs
//! Time source for scheduling estimates
//!
//! Expected start and end times are expressed in microseconds since the
//! clock was created. Tests drive a manual clock to get deterministic
//! bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic clock in microseconds
#[derive(Debug, Clone)]
pub enum Clock {
    Monotonic(Instant),
    Manual(Arc<AtomicU64>),
}

impl Clock {
    pub fn monotonic() -> Self {
        Clock::Monotonic(Instant::now())
    }

    /// Clock that only moves through [`Clock::advance`] or [`Clock::set`]
    pub fn manual(start_us: u64) -> Self {
        Clock::Manual(Arc::new(AtomicU64::new(start_us)))
    }

    /// Current time in microseconds
    pub fn now(&self) -> f64 {
        match self {
            Clock::Monotonic(origin) => origin.elapsed().as_secs_f64() * 1e6,
            Clock::Manual(now) => now.load(Ordering::Acquire) as f64,
        }
    }

    pub fn advance(&self, us: u64) {
        if let Clock::Manual(now) = self {
            now.fetch_add(us, Ordering::AcqRel);
        }
    }

    pub fn set(&self, us: u64) {
        if let Clock::Manual(now) = self {
            now.store(us, Ordering::Release);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::monotonic()
    }
}
