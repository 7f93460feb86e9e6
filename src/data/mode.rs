// src/data/mode.rs
//! Access modes and coherency states

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a task accesses a data handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
    /// Private temporary buffer, contents undefined on entry and discarded
    Scratch,
    /// Commutative accumulation into private buffers
    Redux,
}

impl AccessMode {
    /// Mode used by the concurrency engine: read-write behaves like write
    pub fn normalized(self) -> Self {
        match self {
            AccessMode::ReadWrite => AccessMode::Write,
            mode => mode,
        }
    }

    /// Whether the current contents must be fetched before the access
    pub fn reads(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    /// Whether the access produces a new authoritative copy
    pub fn writes(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }

    /// Scratch and redux buffers live outside the MSI protocol
    pub fn is_relaxed(self) -> bool {
        matches!(self, AccessMode::Scratch | AccessMode::Redux)
    }

    /// Combined mode of two accesses to the same handle by one task
    pub fn merge(self, other: AccessMode) -> AccessMode {
        if self == other {
            self
        } else {
            AccessMode::ReadWrite
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessMode::Read => "R",
            AccessMode::Write => "W",
            AccessMode::ReadWrite => "RW",
            AccessMode::Scratch => "SCRATCH",
            AccessMode::Redux => "REDUX",
        };
        f.write_str(name)
    }
}

/// MSI coherency state of one replicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsiState {
    Owner,
    Shared,
    Invalid,
}

impl MsiState {
    pub fn is_valid(self) -> bool {
        !matches!(self, MsiState::Invalid)
    }
}

/// Relaxed coherency flavour of a private buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelaxedCoherency {
    None,
    Scratch,
    Redux,
}

impl From<AccessMode> for RelaxedCoherency {
    fn from(mode: AccessMode) -> Self {
        match mode {
            AccessMode::Scratch => RelaxedCoherency::Scratch,
            AccessMode::Redux => RelaxedCoherency::Redux,
            _ => RelaxedCoherency::None,
        }
    }
}
