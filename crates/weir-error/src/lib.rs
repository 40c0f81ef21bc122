#![forbid(unsafe_code)]
//! Error types for the weir block pool.
//!
//! Defines `PoolError` and a `Result<T>` alias used throughout the
//! workspace. Invariant violations are not represented here: pool state is
//! corrupt once one is detected, so they assert instead of returning.

use thiserror::Error;

/// Unified error type for pool and swap-device operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("swap device failed to read back block {block}")]
    SwapRead { block: u64 },

    #[error("pin cancelled: block was destroyed")]
    Cancelled,

    #[error("parent memory accountant refused {bytes} bytes")]
    BudgetRefused { bytes: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias using `PoolError`.
pub type Result<T> = std::result::Result<T, PoolError>;
