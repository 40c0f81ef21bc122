//! In-memory swap device for tests and benchmarks.

use crate::{
    ReadCompletion, ReadOutcome, RequestTicket, SwapDevice, SwapStats, WriteCompletion,
    WriteOutcome,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tracing::trace;
use weir_types::{BlockBytes, SwapToken};

enum MemOp {
    Write {
        ticket: RequestTicket,
        data: BlockBytes,
        done: WriteCompletion,
    },
    Read {
        ticket: RequestTicket,
        token: SwapToken,
        len: usize,
        done: ReadCompletion,
    },
}

struct MemShared {
    slots: Mutex<HashMap<u64, Vec<u8>>>,
    reserved: AtomicUsize,
    next_token: AtomicU64,
    queue: Mutex<VecDeque<MemOp>>,
    /// Requests claimed via `start_next` but not yet completed.
    started: Mutex<Vec<MemOp>>,
    queue_cv: Condvar,
    stop: AtomicBool,
    stats: Mutex<SwapStats>,
    fail_writes: AtomicU32,
    fail_reads: AtomicU32,
}

impl MemShared {
    /// Claim and run one request end to end.
    fn execute(&self, op: MemOp) {
        let claimed = match op {
            MemOp::Write { ticket, data, done } => {
                if !ticket.begin() {
                    return;
                }
                MemOp::Write { ticket, data, done }
            }
            MemOp::Read {
                ticket,
                token,
                len,
                done,
            } => {
                if !ticket.begin() {
                    return;
                }
                MemOp::Read {
                    ticket,
                    token,
                    len,
                    done,
                }
            }
        };
        self.run_claimed(claimed);
    }

    /// Run a request whose ticket is already in the running state.
    fn run_claimed(&self, op: MemOp) {
        match op {
            MemOp::Write { ticket, data, done } => {
                if take_one(&self.fail_writes) {
                    self.stats.lock().writes_completed += 1;
                    done(WriteOutcome::Failed);
                    ticket.finish();
                    return;
                }
                let bytes = data.read().clone();
                let len = bytes.len();
                let token = SwapToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
                self.reserved.fetch_add(len, Ordering::Relaxed);
                self.slots.lock().insert(token.0, bytes);
                {
                    let mut stats = self.stats.lock();
                    stats.writes_completed += 1;
                    stats.bytes_written += len as u64;
                }
                trace!(target: "weir::store", event = "mem_write", token = token.0, len);
                done(WriteOutcome::Stored(token));
                ticket.finish();
            }
            MemOp::Read {
                ticket,
                token,
                len,
                done,
            } => {
                if take_one(&self.fail_reads) {
                    self.stats.lock().reads_completed += 1;
                    done(ReadOutcome::Failed);
                    ticket.finish();
                    return;
                }
                let bytes = self.slots.lock().get(&token.0).cloned();
                match bytes {
                    Some(bytes) => {
                        debug_assert_eq!(bytes.len(), len);
                        {
                            let mut stats = self.stats.lock();
                            stats.reads_completed += 1;
                            stats.bytes_read += bytes.len() as u64;
                        }
                        trace!(target: "weir::store", event = "mem_read", token = token.0, len);
                        done(ReadOutcome::Loaded(bytes));
                    }
                    None => {
                        self.stats.lock().reads_completed += 1;
                        done(ReadOutcome::Failed);
                    }
                }
                ticket.finish();
            }
        }
    }

    fn fail_remaining(&self) {
        let remaining: Vec<MemOp> = self.queue.lock().drain(..).collect();
        for op in remaining {
            match op {
                MemOp::Write { ticket, done, .. } => {
                    if ticket.begin() {
                        done(WriteOutcome::Failed);
                        ticket.finish();
                    }
                }
                MemOp::Read { ticket, done, .. } => {
                    if ticket.begin() {
                        done(ReadOutcome::Failed);
                        ticket.finish();
                    }
                }
            }
        }
        let started: Vec<MemOp> = self.started.lock().drain(..).collect();
        for op in started {
            match op {
                MemOp::Write { ticket, done, .. } => {
                    done(WriteOutcome::Failed);
                    ticket.finish();
                }
                MemOp::Read { ticket, done, .. } => {
                    done(ReadOutcome::Failed);
                    ticket.finish();
                }
            }
        }
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory [`SwapDevice`].
///
/// [`new`] completes requests on a background thread; [`paused`] queues
/// them until the test steps completions with [`complete_next`] /
/// [`complete_all`], which is how race windows (write submitted but not
/// completed, concurrent pins on one swapped block) are made deterministic.
///
/// [`new`]: MemSwapDevice::new
/// [`paused`]: MemSwapDevice::paused
/// [`complete_next`]: MemSwapDevice::complete_next
/// [`complete_all`]: MemSwapDevice::complete_all
pub struct MemSwapDevice {
    shared: Arc<MemShared>,
    worker: Option<JoinHandle<()>>,
}

impl MemSwapDevice {
    /// Device with a background completion thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Self::new_shared();
        let thread_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("weir-mem-swap".to_owned())
            .spawn(move || {
                loop {
                    let op = {
                        let mut queue = thread_shared.queue.lock();
                        loop {
                            if let Some(op) = queue.pop_front() {
                                break Some(op);
                            }
                            if thread_shared.stop.load(Ordering::Acquire) {
                                break None;
                            }
                            thread_shared.queue_cv.wait(&mut queue);
                        }
                    };
                    match op {
                        Some(op) => thread_shared.execute(op),
                        None => break,
                    }
                }
            })
            .expect("spawn weir-mem-swap thread");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Device whose completions queue until stepped by the test.
    #[must_use]
    pub fn paused() -> Self {
        Self {
            shared: Self::new_shared(),
            worker: None,
        }
    }

    fn new_shared() -> Arc<MemShared> {
        Arc::new(MemShared {
            slots: Mutex::new(HashMap::new()),
            reserved: AtomicUsize::new(0),
            next_token: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            started: Mutex::new(Vec::new()),
            queue_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            stats: Mutex::new(SwapStats::default()),
            fail_writes: AtomicU32::new(0),
            fail_reads: AtomicU32::new(0),
        })
    }

    /// Run the oldest queued completion on the calling thread.
    ///
    /// Only meaningful on a [`paused`](MemSwapDevice::paused) device.
    pub fn complete_next(&self) -> bool {
        let op = self.shared.queue.lock().pop_front();
        match op {
            Some(op) => {
                self.shared.execute(op);
                true
            }
            None => false,
        }
    }

    /// Run every queued completion; returns how many ran.
    pub fn complete_all(&self) -> usize {
        let mut ran = 0;
        while self.complete_next() {
            ran += 1;
        }
        ran
    }

    /// Claim the oldest queued request without completing it, putting it in
    /// the state a real device is in mid-I/O: started, uncancellable, not
    /// yet complete. Pair with [`complete_started`](Self::complete_started).
    pub fn start_next(&self) -> bool {
        let op = self.shared.queue.lock().pop_front();
        let Some(op) = op else { return false };
        let claimed = match op {
            MemOp::Write { ticket, data, done } => {
                if !ticket.begin() {
                    return false;
                }
                MemOp::Write { ticket, data, done }
            }
            MemOp::Read {
                ticket,
                token,
                len,
                done,
            } => {
                if !ticket.begin() {
                    return false;
                }
                MemOp::Read {
                    ticket,
                    token,
                    len,
                    done,
                }
            }
        };
        self.shared.started.lock().push(claimed);
        true
    }

    /// Complete every request previously claimed by `start_next`.
    pub fn complete_started(&self) -> usize {
        let started: Vec<MemOp> = self.shared.started.lock().drain(..).collect();
        let ran = started.len();
        for op in started {
            self.shared.run_claimed(op);
        }
        ran
    }

    /// Number of requests waiting for completion.
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Fail the next `n` writes instead of storing them.
    pub fn inject_write_failures(&self, n: u32) {
        self.shared.fail_writes.fetch_add(n, Ordering::AcqRel);
    }

    /// Fail the next `n` reads.
    pub fn inject_read_failures(&self, n: u32) {
        self.shared.fail_reads.fetch_add(n, Ordering::AcqRel);
    }

    #[must_use]
    pub fn stats(&self) -> SwapStats {
        *self.shared.stats.lock()
    }
}

impl Default for MemSwapDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemSwapDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemSwapDevice")
            .field("slots", &self.shared.slots.lock().len())
            .field("reserved", &self.shared.reserved.load(Ordering::Relaxed))
            .field("paused", &self.worker.is_none())
            .finish_non_exhaustive()
    }
}

impl Drop for MemSwapDevice {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.queue_cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.fail_remaining();
    }
}

impl SwapDevice for MemSwapDevice {
    fn submit_write(&self, data: BlockBytes, done: WriteCompletion) -> RequestTicket {
        let ticket = RequestTicket::new();
        self.shared.stats.lock().writes_submitted += 1;
        self.shared.queue.lock().push_back(MemOp::Write {
            ticket: ticket.clone(),
            data,
            done,
        });
        self.shared.queue_cv.notify_one();
        ticket
    }

    fn submit_read(&self, token: SwapToken, len: usize, done: ReadCompletion) -> RequestTicket {
        let ticket = RequestTicket::new();
        self.shared.stats.lock().reads_submitted += 1;
        self.shared.queue.lock().push_back(MemOp::Read {
            ticket: ticket.clone(),
            token,
            len,
            done,
        });
        self.shared.queue_cv.notify_one();
        ticket
    }

    fn discard(&self, token: SwapToken) {
        let removed = self.shared.slots.lock().remove(&token.0);
        if let Some(bytes) = removed {
            self.shared.reserved.fetch_sub(bytes.len(), Ordering::Relaxed);
            trace!(target: "weir::store", event = "mem_discard", token = token.0, len = bytes.len());
        }
    }

    fn reserved_bytes(&self) -> usize {
        self.shared.reserved.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn collect_write() -> (Arc<PlMutex<Option<WriteOutcome>>>, WriteCompletion) {
        let slot = Arc::new(PlMutex::new(None));
        let out = Arc::clone(&slot);
        (slot, Box::new(move |outcome| *out.lock() = Some(outcome)))
    }

    fn collect_read() -> (Arc<PlMutex<Option<ReadOutcome>>>, ReadCompletion) {
        let slot = Arc::new(PlMutex::new(None));
        let out = Arc::clone(&slot);
        (slot, Box::new(move |outcome| *out.lock() = Some(outcome)))
    }

    #[test]
    fn paused_device_steps_completions_in_order() {
        let dev = MemSwapDevice::paused();
        let data = BlockBytes::zeroed(16);
        data.write()[0] = 0x5A;

        let (wrote, done) = collect_write();
        dev.submit_write(data, done);
        assert_eq!(dev.pending_ops(), 1);
        assert!(wrote.lock().is_none());

        assert!(dev.complete_next());
        let token = match wrote.lock().take() {
            Some(WriteOutcome::Stored(token)) => token,
            other => panic!("expected Stored, got {other:?}"),
        };
        assert_eq!(dev.reserved_bytes(), 16);

        let (read, done) = collect_read();
        dev.submit_read(token, 16, done);
        assert_eq!(dev.complete_all(), 1);
        match read.lock().take() {
            Some(ReadOutcome::Loaded(bytes)) => assert_eq!(bytes[0], 0x5A),
            other => panic!("expected Loaded, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_request_never_completes() {
        let dev = MemSwapDevice::paused();
        let (wrote, done) = collect_write();
        let ticket = dev.submit_write(BlockBytes::zeroed(8), done);

        assert!(ticket.try_cancel());
        dev.complete_all();
        assert!(wrote.lock().is_none());
    }

    #[test]
    fn discard_releases_reservation() {
        let dev = MemSwapDevice::paused();
        let (wrote, done) = collect_write();
        dev.submit_write(BlockBytes::zeroed(32), done);
        dev.complete_all();
        let token = match wrote.lock().take() {
            Some(WriteOutcome::Stored(token)) => token,
            other => panic!("expected Stored, got {other:?}"),
        };

        assert_eq!(dev.reserved_bytes(), 32);
        dev.discard(token);
        assert_eq!(dev.reserved_bytes(), 0);

        let (read, done) = collect_read();
        dev.submit_read(token, 32, done);
        dev.complete_all();
        assert!(matches!(read.lock().take(), Some(ReadOutcome::Failed)));
    }

    #[test]
    fn injected_write_failure_consumed_once() {
        let dev = MemSwapDevice::paused();
        dev.inject_write_failures(1);

        let (first, done) = collect_write();
        dev.submit_write(BlockBytes::zeroed(8), done);
        let (second, done) = collect_write();
        dev.submit_write(BlockBytes::zeroed(8), done);
        dev.complete_all();

        assert!(matches!(first.lock().take(), Some(WriteOutcome::Failed)));
        assert!(matches!(second.lock().take(), Some(WriteOutcome::Stored(_))));
    }

    #[test]
    fn started_request_is_uncancellable_until_completed() {
        let dev = MemSwapDevice::paused();
        let (wrote, done) = collect_write();
        let ticket = dev.submit_write(BlockBytes::zeroed(8), done);

        assert!(dev.start_next());
        assert!(!ticket.try_cancel());
        assert!(wrote.lock().is_none());

        assert_eq!(dev.complete_started(), 1);
        assert!(matches!(wrote.lock().take(), Some(WriteOutcome::Stored(_))));
        assert!(ticket.is_done());
    }

    #[test]
    fn background_thread_completes_requests() {
        let dev = MemSwapDevice::new();
        let (wrote, done) = collect_write();
        dev.submit_write(BlockBytes::zeroed(8), done);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while wrote.lock().is_none() {
            assert!(std::time::Instant::now() < deadline, "write never completed");
            std::thread::yield_now();
        }
        assert!(matches!(wrote.lock().take(), Some(WriteOutcome::Stored(_))));
    }
}
