//! Single-shot pin futures.
//!
//! `pin` resolves either on the caller's stack (block already in RAM) or
//! from a swap-in completion on the device thread. The promise/waiter pair
//! here is the simplest shape that covers both: one slot, one condvar,
//! resolved exactly once with the pinned handle or an error.

use crate::handle::PinnedBlock;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use weir_error::{PoolError, Result};

struct FutureShared {
    slot: Mutex<Option<Result<PinnedBlock>>>,
    ready: Condvar,
}

impl fmt::Debug for FutureShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureShared")
            .field("ready", &self.slot.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// Resolver half. Consumed by `resolve`; dropping it unresolved delivers
/// `Cancelled` so a waiter can never hang on a promise the pool lost.
#[derive(Debug)]
pub(crate) struct PinPromise {
    shared: Arc<FutureShared>,
    resolved: bool,
}

impl PinPromise {
    pub(crate) fn resolve(mut self, result: Result<PinnedBlock>) {
        {
            let mut slot = self.shared.slot.lock();
            debug_assert!(slot.is_none(), "pin promise resolved twice");
            *slot = Some(result);
        }
        self.resolved = true;
        self.shared.ready.notify_all();
    }
}

impl Drop for PinPromise {
    fn drop(&mut self) {
        if !self.resolved {
            {
                let mut slot = self.shared.slot.lock();
                if slot.is_none() {
                    *slot = Some(Err(PoolError::Cancelled));
                }
            }
            self.shared.ready.notify_all();
        }
    }
}

/// Waiter half of a pin request.
#[derive(Debug)]
pub struct PinFuture {
    shared: Arc<FutureShared>,
}

impl PinFuture {
    /// Block until the pin resolves.
    pub fn wait(self) -> Result<PinnedBlock> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Take the result if the pin already resolved; otherwise hand the
    /// future back without blocking.
    pub fn try_wait(self) -> std::result::Result<Result<PinnedBlock>, Self> {
        let taken = self.shared.slot.lock().take();
        match taken {
            Some(result) => Ok(result),
            None => Err(self),
        }
    }

    /// Block up to `timeout`; returns the future back on expiry.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<PinnedBlock>, Self> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return Ok(result);
            }
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                let result = slot.take();
                drop(slot);
                return match result {
                    Some(result) => Ok(result),
                    None => Err(self),
                };
            }
        }
    }

    /// Whether a call to `wait` would return immediately.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.shared.slot.lock().is_some()
    }
}

pub(crate) fn pin_channel() -> (PinPromise, PinFuture) {
    let shared = Arc::new(FutureShared {
        slot: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        PinPromise {
            shared: Arc::clone(&shared),
            resolved: false,
        },
        PinFuture { shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_before_wait() {
        let (promise, future) = pin_channel();
        promise.resolve(Err(PoolError::Cancelled));
        assert!(future.is_ready());
        assert!(matches!(future.wait(), Err(PoolError::Cancelled)));
    }

    #[test]
    fn resolve_from_another_thread_wakes_waiter() {
        let (promise, future) = pin_channel();
        let resolver = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            promise.resolve(Err(PoolError::SwapRead { block: 9 }));
        });
        assert!(matches!(future.wait(), Err(PoolError::SwapRead { block: 9 })));
        resolver.join().unwrap();
    }

    #[test]
    fn dropped_promise_delivers_cancelled() {
        let (promise, future) = pin_channel();
        drop(promise);
        assert!(matches!(future.wait(), Err(PoolError::Cancelled)));
    }

    #[test]
    fn try_wait_is_non_blocking() {
        let (promise, future) = pin_channel();
        let future = match future.try_wait() {
            Err(future) => future,
            Ok(result) => panic!("resolved early: {result:?}"),
        };
        promise.resolve(Err(PoolError::Cancelled));
        assert!(matches!(future.try_wait(), Ok(Err(PoolError::Cancelled))));
    }

    #[test]
    fn timeout_returns_the_future_back() {
        let (promise, future) = pin_channel();
        let future = match future.wait_timeout(Duration::from_millis(5)) {
            Err(future) => future,
            Ok(result) => panic!("resolved early: {result:?}"),
        };
        promise.resolve(Err(PoolError::Cancelled));
        assert!(matches!(future.wait(), Err(PoolError::Cancelled)));
    }
}
