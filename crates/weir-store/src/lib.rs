#![forbid(unsafe_code)]
//! Asynchronous swap devices for the weir block pool.
//!
//! Evicted blocks are written out through a [`SwapDevice`] and read back on
//! pin faults. Submissions are non-blocking: they enqueue work and return a
//! [`RequestTicket`]; the device invokes the supplied completion exactly
//! once from its own completion context, never on the submitting thread's
//! stack. That contract is what allows the pool to submit while holding its
//! state mutex.
//!
//! Two devices are provided: [`FileSwapDevice`] (a file plus one named I/O
//! thread doing `pread`/`pwrite`) and [`MemSwapDevice`] (in-memory, with an
//! optional paused mode that lets tests step completions by hand).

mod file;
mod mem;

pub use file::FileSwapDevice;
pub use mem::MemSwapDevice;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use weir_types::{BlockBytes, SwapToken};

/// Outcome of a swap-out write.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The bytes are stored; the token names the copy from now on.
    Stored(SwapToken),
    /// The device could not store the bytes. The RAM copy stays
    /// authoritative and the pool may retry later.
    Failed,
}

/// Outcome of a swap-in read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// The stored copy, returned by value.
    Loaded(Vec<u8>),
    /// The device could not produce the bytes.
    Failed,
}

/// Completion callback for [`SwapDevice::submit_write`].
pub type WriteCompletion = Box<dyn FnOnce(WriteOutcome) + Send>;

/// Completion callback for [`SwapDevice::submit_read`].
pub type ReadCompletion = Box<dyn FnOnce(ReadOutcome) + Send>;

const REQ_PENDING: u8 = 0;
const REQ_RUNNING: u8 = 1;
const REQ_DONE: u8 = 2;
const REQ_CANCELLED: u8 = 3;

/// Shared state of one in-flight swap request.
///
/// `try_cancel` races against the device picking the request up: it
/// succeeds only while the request is still queued. A cancelled request
/// never invokes its completion; any other request invokes it exactly once.
#[derive(Clone)]
pub struct RequestTicket {
    state: Arc<AtomicU8>,
}

impl RequestTicket {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(REQ_PENDING)),
        }
    }

    /// Cancel the request if it has not started. Returns `true` on success,
    /// in which case the completion will never run.
    pub fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(REQ_PENDING, REQ_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Device side: claim the request for execution. Returns `false` if it
    /// was cancelled first.
    pub fn begin(&self) -> bool {
        self.state
            .compare_exchange(REQ_PENDING, REQ_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Device side: mark the request complete (after the completion ran).
    pub fn finish(&self) {
        self.state.store(REQ_DONE, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == REQ_CANCELLED
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == REQ_DONE
    }
}

impl Default for RequestTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            REQ_PENDING => "pending",
            REQ_RUNNING => "running",
            REQ_DONE => "done",
            _ => "cancelled",
        };
        f.debug_struct("RequestTicket").field("state", &state).finish()
    }
}

/// Swap device statistics, monotonic over the device's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapStats {
    pub writes_submitted: u64,
    pub reads_submitted: u64,
    pub writes_completed: u64,
    pub reads_completed: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

/// Asynchronous block swap device.
///
/// `submit_write` snapshots the shared region on the device's thread; the
/// caller guarantees no writer mutates it while the request is in flight
/// (the pool only evicts blocks with zero pins).
pub trait SwapDevice: Send + Sync + fmt::Debug {
    /// Queue a write of `data`; the completion receives the minted token.
    fn submit_write(&self, data: BlockBytes, done: WriteCompletion) -> RequestTicket;

    /// Queue a read of the copy named by `token` (`len` bytes).
    fn submit_read(&self, token: SwapToken, len: usize, done: ReadCompletion) -> RequestTicket;

    /// Drop the stored copy named by `token`, releasing its reservation.
    fn discard(&self, token: SwapToken);

    /// Bytes currently reserved on the device for stored copies.
    fn reserved_bytes(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_cancel_wins_only_before_begin() {
        let t = RequestTicket::new();
        assert!(t.try_cancel());
        assert!(t.is_cancelled());
        assert!(!t.begin());

        let t = RequestTicket::new();
        assert!(t.begin());
        assert!(!t.try_cancel());
        t.finish();
        assert!(t.is_done());
    }
}
