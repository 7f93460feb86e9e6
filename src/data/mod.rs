// src/data/mod.rs
//! Data handles and their per-node replicates
//!
//! - **Handle**: logical identity of one piece of application data
//! - **Replicate**: one copy per memory node with an MSI state
//! - **Layout**: opaque shape (size, footprint, partitioning)
//! - **Requester**: FIFO of accesses waiting on a handle
//! - **Subtree guard**: all-or-nothing locking of partition subtrees
//!
//! # Architecture
//!
//! ```text
//!            DataHandle (id, home node)
//!                    │
//!          SpinLock<HandleHeader>
//!     ┌──────────────┼───────────────────┐
//!  refcnt      req_list (FIFO)      replicates[node]
//!  current_mode                    ┌─────┴─────┐
//!                               RAM: Owner   GPU: Invalid ...
//! ```

pub mod handle;
pub mod layout;
pub mod mode;
pub mod replicate;
pub mod requester;
pub mod subtree;

// Re-export commonly used types
pub use handle::{DataHandle, HandleHeader, HandleId};
pub use layout::{DataLayout, Footprint, LayoutPiece, PartitionFilter};
pub use mode::{AccessMode, MsiState, RelaxedCoherency};
pub use replicate::{BufferOrigin, Replicate};
pub use requester::{DataRequester, Waiter};
pub use subtree::SubtreeGuard;
