//! File-backed swap device.

use crate::{
    ReadCompletion, ReadOutcome, RequestTicket, SwapDevice, SwapStats, WriteCompletion,
    WriteOutcome,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};
use weir_error::Result;
use weir_types::{BlockBytes, SwapToken};

#[derive(Debug, Clone, Copy)]
struct Extent {
    offset: u64,
    len: usize,
}

/// First-fit extent allocation over the swap file, with bump growth at the
/// tail. Freed extents are reused; adjacent-extent coalescing is not done
/// because blocks re-enter at the same handful of sizes in practice.
#[derive(Debug, Default)]
struct SlotMap {
    next_offset: u64,
    next_token: u64,
    free: Vec<Extent>,
    live: HashMap<u64, Extent>,
    reserved: usize,
}

impl SlotMap {
    fn allocate(&mut self, len: usize) -> (SwapToken, Extent) {
        self.next_token += 1;
        let token = SwapToken(self.next_token);

        let extent = if let Some(i) = self.free.iter().position(|e| e.len >= len) {
            let found = self.free[i];
            if found.len == len {
                self.free.swap_remove(i);
                found
            } else {
                self.free[i] = Extent {
                    offset: found.offset + len as u64,
                    len: found.len - len,
                };
                Extent {
                    offset: found.offset,
                    len,
                }
            }
        } else {
            let offset = self.next_offset;
            self.next_offset += len as u64;
            Extent { offset, len }
        };
        (token, extent)
    }

    fn commit(&mut self, token: SwapToken, extent: Extent) {
        self.live.insert(token.0, extent);
        self.reserved += extent.len;
    }

    fn release(&mut self, extent: Extent) {
        self.free.push(extent);
    }

    fn discard(&mut self, token: SwapToken) -> Option<Extent> {
        let extent = self.live.remove(&token.0)?;
        self.reserved -= extent.len;
        self.free.push(extent);
        Some(extent)
    }

    fn lookup(&self, token: SwapToken) -> Option<Extent> {
        self.live.get(&token.0).copied()
    }
}

enum FileOp {
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

struct FileShared {
    file: File,
    slots: Mutex<SlotMap>,
    queue: Mutex<VecDeque<FileOp>>,
    queue_cv: Condvar,
    stop: AtomicBool,
    stats: Mutex<SwapStats>,
}

impl FileShared {
    fn execute(&self, op: FileOp) {
        match op {
            FileOp::Write { ticket, data, done } => {
                if !ticket.begin() {
                    return;
                }
                let len = data.len();
                let (token, extent) = self.slots.lock().allocate(len);
                let wrote = {
                    let guard = data.read();
                    self.file.write_all_at(&guard, extent.offset)
                };
                match wrote {
                    Ok(()) => {
                        self.slots.lock().commit(token, extent);
                        {
                            let mut stats = self.stats.lock();
                            stats.writes_completed += 1;
                            stats.bytes_written += len as u64;
                        }
                        trace!(
                            target: "weir::store",
                            event = "swap_write",
                            token = token.0,
                            offset = extent.offset,
                            len
                        );
                        done(WriteOutcome::Stored(token));
                    }
                    Err(err) => {
                        self.slots.lock().release(extent);
                        self.stats.lock().writes_completed += 1;
                        warn!(
                            target: "weir::store",
                            event = "swap_write_failed",
                            offset = extent.offset,
                            len,
                            error = %err
                        );
                        done(WriteOutcome::Failed);
                    }
                }
                ticket.finish();
            }
            FileOp::Read {
                ticket,
                token,
                len,
                done,
            } => {
                if !ticket.begin() {
                    return;
                }
                let Some(extent) = self.slots.lock().lookup(token) else {
                    self.stats.lock().reads_completed += 1;
                    done(ReadOutcome::Failed);
                    ticket.finish();
                    return;
                };
                debug_assert_eq!(extent.len, len);
                let mut buf = vec![0_u8; len];
                match self.file.read_exact_at(&mut buf, extent.offset) {
                    Ok(()) => {
                        {
                            let mut stats = self.stats.lock();
                            stats.reads_completed += 1;
                            stats.bytes_read += len as u64;
                        }
                        trace!(
                            target: "weir::store",
                            event = "swap_read",
                            token = token.0,
                            offset = extent.offset,
                            len
                        );
                        done(ReadOutcome::Loaded(buf));
                    }
                    Err(err) => {
                        self.stats.lock().reads_completed += 1;
                        warn!(
                            target: "weir::store",
                            event = "swap_read_failed",
                            token = token.0,
                            offset = extent.offset,
                            error = %err
                        );
                        done(ReadOutcome::Failed);
                    }
                }
                ticket.finish();
            }
        }
    }

    fn fail_remaining(&self) {
        let remaining: Vec<FileOp> = self.queue.lock().drain(..).collect();
        for op in remaining {
            match op {
                FileOp::Write { ticket, done, .. } => {
                    if ticket.begin() {
                        done(WriteOutcome::Failed);
                        ticket.finish();
                    }
                }
                FileOp::Read { ticket, done, .. } => {
                    if ticket.begin() {
                        done(ReadOutcome::Failed);
                        ticket.finish();
                    }
                }
            }
        }
    }
}

/// File-backed [`SwapDevice`]: one named I/O thread drains a FIFO of
/// requests and performs positioned reads and writes against a single swap
/// file. Dropping the device stops the thread and fails whatever is still
/// queued.
pub struct FileSwapDevice {
    shared: Arc<FileShared>,
    worker: Option<JoinHandle<()>>,
}

impl FileSwapDevice {
    /// Create (or truncate) the swap file at `path` and start the I/O
    /// thread.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        debug!(target: "weir::store", event = "swap_file_created", path = %path.display());

        let shared = Arc::new(FileShared {
            file,
            slots: Mutex::new(SlotMap::default()),
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            stats: Mutex::new(SwapStats::default()),
        });

        let thread_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("weir-swap-io".to_owned())
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
            .map_err(weir_error::PoolError::Io)?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    #[must_use]
    pub fn stats(&self) -> SwapStats {
        *self.shared.stats.lock()
    }
}

impl fmt::Debug for FileSwapDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.shared.slots.lock();
        f.debug_struct("FileSwapDevice")
            .field("live_slots", &slots.live.len())
            .field("reserved", &slots.reserved)
            .field("file_tail", &slots.next_offset)
            .finish_non_exhaustive()
    }
}

impl Drop for FileSwapDevice {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.queue_cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.fail_remaining();
    }
}

impl SwapDevice for FileSwapDevice {
    fn submit_write(&self, data: BlockBytes, done: WriteCompletion) -> RequestTicket {
        let ticket = RequestTicket::new();
        self.shared.stats.lock().writes_submitted += 1;
        self.shared.queue.lock().push_back(FileOp::Write {
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
        self.shared.queue.lock().push_back(FileOp::Read {
            ticket: ticket.clone(),
            token,
            len,
            done,
        });
        self.shared.queue_cv.notify_one();
        ticket
    }

    fn discard(&self, token: SwapToken) {
        if let Some(extent) = self.shared.slots.lock().discard(token) {
            trace!(
                target: "weir::store",
                event = "swap_discard",
                token = token.0,
                offset = extent.offset,
                len = extent.len
            );
        }
    }

    fn reserved_bytes(&self) -> usize {
        self.shared.slots.lock().reserved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::time::{Duration, Instant};

    fn wait_for<T>(slot: &Arc<PlMutex<Option<T>>>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(value) = slot.lock().take() {
                return value;
            }
            assert!(Instant::now() < deadline, "completion never arrived");
            thread::yield_now();
        }
    }

    fn write_block(dev: &FileSwapDevice, fill: u8, len: usize) -> SwapToken {
        let data = BlockBytes::zeroed(len);
        data.write().fill(fill);
        let slot = Arc::new(PlMutex::new(None));
        let out = Arc::clone(&slot);
        dev.submit_write(data, Box::new(move |outcome| *out.lock() = Some(outcome)));
        match wait_for(&slot) {
            WriteOutcome::Stored(token) => token,
            WriteOutcome::Failed => panic!("write failed"),
        }
    }

    fn read_block(dev: &FileSwapDevice, token: SwapToken, len: usize) -> Vec<u8> {
        let slot = Arc::new(PlMutex::new(None));
        let out = Arc::clone(&slot);
        dev.submit_read(token, len, Box::new(move |outcome| *out.lock() = Some(outcome)));
        match wait_for(&slot) {
            ReadOutcome::Loaded(bytes) => bytes,
            ReadOutcome::Failed => panic!("read failed"),
        }
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileSwapDevice::create(dir.path().join("swap.bin")).unwrap();

        let token = write_block(&dev, 0xC3, 4096);
        assert_eq!(dev.reserved_bytes(), 4096);

        let bytes = read_block(&dev, token, 4096);
        assert_eq!(bytes.len(), 4096);
        assert!(bytes.iter().all(|b| *b == 0xC3));

        let stats = dev.stats();
        assert_eq!(stats.writes_completed, 1);
        assert_eq!(stats.reads_completed, 1);
        assert_eq!(stats.bytes_written, 4096);
    }

    #[test]
    fn discarded_extent_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileSwapDevice::create(dir.path().join("swap.bin")).unwrap();

        let first = write_block(&dev, 1, 1024);
        dev.discard(first);
        assert_eq!(dev.reserved_bytes(), 0);

        let second = write_block(&dev, 2, 1024);
        assert_eq!(dev.reserved_bytes(), 1024);
        // Same extent recycled: the file never grows past one slot.
        assert_eq!(dev.shared.slots.lock().next_offset, 1024);

        let bytes = read_block(&dev, second, 1024);
        assert!(bytes.iter().all(|b| *b == 2));
    }

    #[test]
    fn read_of_discarded_token_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileSwapDevice::create(dir.path().join("swap.bin")).unwrap();

        let token = write_block(&dev, 5, 512);
        dev.discard(token);

        let slot = Arc::new(PlMutex::new(None));
        let out = Arc::clone(&slot);
        dev.submit_read(token, 512, Box::new(move |outcome| *out.lock() = Some(outcome)));
        assert!(matches!(wait_for(&slot), ReadOutcome::Failed));
    }

    #[test]
    fn mixed_sizes_share_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileSwapDevice::create(dir.path().join("swap.bin")).unwrap();

        let small = write_block(&dev, 0x11, 256);
        let large = write_block(&dev, 0x22, 2048);
        assert_eq!(dev.reserved_bytes(), 256 + 2048);

        assert!(read_block(&dev, small, 256).iter().all(|b| *b == 0x11));
        assert!(read_block(&dev, large, 2048).iter().all(|b| *b == 0x22));
    }
}
