// src/sched/policies/mod.rs
//! Built-in scheduling policies

pub mod central;
pub mod dmda;
pub mod modular;
pub mod random;

pub use central::CentralQueuePolicy;
pub use dmda::{DequeModelPolicy, DmVariant};
pub use modular::{ModularRecipe, TreePolicy};
pub use random::RandomPolicy;
