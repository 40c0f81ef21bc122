#![forbid(unsafe_code)]
//! Weir public API facade.
//!
//! Re-exports the block pool, swap devices, and shared types through one
//! stable external interface. This is the crate the dataflow layers depend
//! on.

pub use weir_error::{PoolError, Result};
pub use weir_pool::*;
pub use weir_store::{FileSwapDevice, MemSwapDevice, SwapDevice, SwapStats};
pub use weir_types::{BlockBytes, BlockId, SwapToken, WorkerId};
