// src/utils/mod.rs
//! Common utilities: errors, configuration and time keeping

pub mod config;
pub mod errors;
pub mod timing;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use errors::{Result, RuntimeError};
pub use timing::Clock;
