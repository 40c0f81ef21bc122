#![forbid(unsafe_code)]
//! Host-local block pool for a distributed dataflow runtime.
//!
//! Every intermediate data buffer a worker produces or consumes lives here
//! as a fixed-size block. The pool keeps the working set inside configured
//! RAM budgets by writing idle blocks out to a swap device and reading
//! them back on demand:
//!
//! - [`BlockPool::allocate`] admits bytes against the hard limit (blocking
//!   while it is exceeded) and returns a block pinned for the caller's
//!   worker.
//! - Dropping the pin makes the block evictable; crossing the soft limit
//!   writes the oldest idle blocks out asynchronously.
//! - [`BlockPool::pin`] returns a [`PinFuture`]: immediate for resident
//!   blocks, resolved by the read completion for swapped ones.
//!
//! Pins are counted per worker, so leaks are attributable and teardown can
//! verify that every pin was released.

mod budget;
mod future;
mod handle;
mod lru;
mod pins;
mod pool;
mod swap;

pub use budget::{BudgetRefusal, NoopRamAccountant, RamAccountant};
pub use future::PinFuture;
pub use handle::{BlockRef, PinnedBlock};
pub use pool::{BlockPool, PoolConfig, PoolMetrics};

#[cfg(test)]
mod tests {
    use super::*;
    use weir_types::WorkerId;

    #[test]
    fn allocate_returns_a_pinned_zeroed_block() {
        let pool = BlockPool::new_for_tests(1);
        let pinned = pool.allocate(1024, WorkerId(0)).unwrap();

        assert_eq!(pinned.size(), 1024);
        assert!(pinned.read().iter().all(|b| *b == 0));
        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.total_ram_use(), 1024);
        assert_eq!(pool.total_pins(), 1);
        assert_eq!(pool.pins_per_worker(), vec![1]);
    }

    #[test]
    fn unpin_then_pin_resolves_synchronously() {
        let pool = BlockPool::new_for_tests(1);
        let pinned = pool.allocate(512, WorkerId(0)).unwrap();
        pinned.write()[..4].copy_from_slice(b"weir");
        let blk = pinned.unpin();
        assert_eq!(pool.total_pins(), 0);

        let future = pool.pin(&blk, WorkerId(0));
        assert!(future.is_ready());
        let pinned = future.wait().unwrap();
        assert_eq!(&pinned.read()[..4], b"weir");
        assert_eq!(pool.total_pins(), 1);
    }

    #[test]
    fn clone_of_pinned_block_takes_another_pin() {
        let pool = BlockPool::new_for_tests(2);
        let pinned = pool.allocate(256, WorkerId(1)).unwrap();
        let second = pinned.clone();
        assert_eq!(pool.total_pins(), 2);
        assert_eq!(pool.pins_per_worker(), vec![0, 2]);
        assert_eq!(pool.total_pinned_bytes(), 512);

        drop(second);
        assert_eq!(pool.total_pins(), 1);
        drop(pinned);
        assert_eq!(pool.total_pins(), 0);
    }

    #[test]
    fn destroy_returns_ram_to_the_budget() {
        let pool = BlockPool::new_for_tests(1);
        let before = pool.total_ram_use();
        let pinned = pool.allocate(2048, WorkerId(0)).unwrap();
        assert_eq!(pool.total_ram_use(), before + 2048);

        drop(pinned);
        assert_eq!(pool.total_ram_use(), before);
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn metrics_snapshot_is_consistent() {
        let pool = BlockPool::new_for_tests(2);
        let a = pool.allocate(1024, WorkerId(0)).unwrap();
        let _b = pool.allocate(512, WorkerId(1)).unwrap();
        let _a2 = a.clone();

        let metrics = pool.metrics();
        assert_eq!(metrics.block_count, 2);
        assert_eq!(metrics.total_ram_use, 1536);
        assert_eq!(metrics.total_pins, 3);
        assert_eq!(metrics.total_pinned_bytes, 2560);
        assert_eq!(metrics.pins_per_worker, vec![2, 1]);
        assert_eq!(metrics.max_pins, 3);
        assert_eq!(metrics.num_swapped_blocks, 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let inverted_limits = PoolConfig {
            soft_ram_limit: 4096,
            hard_ram_limit: 1024,
            workers_per_host: 1,
        };
        assert!(matches!(
            BlockPool::new(
                inverted_limits,
                std::sync::Arc::new(weir_store::MemSwapDevice::new()),
                std::sync::Arc::new(NoopRamAccountant),
            ),
            Err(weir_error::PoolError::Config(_))
        ));

        assert!(matches!(
            BlockPool::new(
                PoolConfig::unlimited(0),
                std::sync::Arc::new(weir_store::MemSwapDevice::new()),
                std::sync::Arc::new(NoopRamAccountant),
            ),
            Err(weir_error::PoolError::Config(_))
        ));
    }

    #[test]
    #[should_panic(expected = "worker id 3 out of range")]
    fn out_of_range_worker_id_asserts() {
        let pool = BlockPool::new_for_tests(2);
        let _ = pool.allocate(64, WorkerId(3));
    }
}
