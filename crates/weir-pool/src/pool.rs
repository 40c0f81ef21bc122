//! The block pool core.
//!
//! One mutex serializes every state transition across all substructures
//! (budget, pin table, unpinned set, swap index). Mutations are short and
//! touch several of them together, so finer locking would multiply the
//! state machine without buying throughput. The lock is released only
//! inside condition-variable waits; swap I/O is submitted non-blocking and
//! completions re-enter under the lock.
//!
//! Per-block residency:
//!
//! ```text
//!         allocate
//!    ∅ ───────────► pinned-in-RAM ◄──────────────┐
//!                   │   ▲                        │
//!          unpin →0 │   │ pin                    │ read ok
//!                   ▼   │                        │
//!               unpinned-in-RAM              reading
//!                   │   ▲                        ▲
//!           evict   │   │ write failed           │ pin
//!                   ▼   │                        │
//!               writing ────write ok────► swapped
//! ```
//!
//! Pinning a block in `writing` rescues it: the write is cancelled when
//! still queued, otherwise the pin waits for the completion and the stored
//! copy is discarded (the rescuer may modify RAM, so the device copy can
//! no longer be trusted). Destroy is legal from every unpinned state and
//! cancels in-flight I/O best-effort.

use crate::budget::{MemoryBudget, NoopRamAccountant, RamAccountant};
use crate::future::{PinFuture, PinPromise, pin_channel};
use crate::handle::{BlockRef, PinnedBlock, WeakBlockRef};
use crate::lru::UnpinnedLru;
use crate::pins::PinTable;
use crate::swap::{ReadState, ReadWaiter, RescueWaiter, SwapIndex, WriteState};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};
use weir_error::{PoolError, Result};
use weir_store::{
    MemSwapDevice, ReadCompletion, ReadOutcome, RequestTicket, SwapDevice, WriteCompletion,
    WriteOutcome,
};
use weir_types::{BlockBytes, BlockId, SwapToken, WorkerId};

/// Pool configuration. Limits are bytes; 0 disables the mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Eviction starts once resident bytes exceed this. 0 = no proactive
    /// eviction.
    pub soft_ram_limit: usize,
    /// Admissions block once resident plus pending bytes exceed this.
    /// 0 = admissions never block.
    pub hard_ram_limit: usize,
    /// Number of worker threads on this host; sizes the per-worker pin
    /// arrays and bounds every `WorkerId`.
    pub workers_per_host: usize,
}

impl PoolConfig {
    /// No limits: nothing is ever evicted and nothing ever blocks.
    #[must_use]
    pub fn unlimited(workers_per_host: usize) -> Self {
        Self {
            soft_ram_limit: 0,
            hard_ram_limit: 0,
            workers_per_host,
        }
    }

    fn validate(self) -> Result<Self> {
        if self.workers_per_host == 0 {
            return Err(PoolError::Config(
                "workers_per_host must be at least 1".to_owned(),
            ));
        }
        if self.soft_ram_limit > 0
            && self.hard_ram_limit > 0
            && self.hard_ram_limit < self.soft_ram_limit
        {
            return Err(PoolError::Config(
                "hard_ram_limit must be at least soft_ram_limit".to_owned(),
            ));
        }
        Ok(self)
    }
}

/// Point-in-time snapshot of pool counters.
///
/// Taken under a brief lock; the profiler polls this instead of the
/// individual getters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMetrics {
    pub block_count: usize,
    pub total_ram_use: usize,
    pub writing_bytes: usize,
    pub requested_bytes: usize,
    pub unpinned_blocks: usize,
    pub num_writing_blocks: usize,
    pub num_reading_blocks: usize,
    pub num_swapped_blocks: usize,
    pub total_pins: usize,
    pub total_pinned_bytes: usize,
    pub max_pins: usize,
    pub max_pinned_bytes: usize,
    pub pins_per_worker: Vec<usize>,
    pub pinned_bytes_per_worker: Vec<usize>,
}

#[derive(Debug)]
struct BlockEntry {
    size: usize,
    data: Option<BlockBytes>,
    token: Option<SwapToken>,
    worker_pins: Vec<u32>,
    pin_total: u32,
    /// Destroyed while a write was in flight; reclaimed at completion.
    doomed: bool,
}

impl BlockEntry {
    fn new(size: usize, workers_per_host: usize) -> Self {
        Self {
            size,
            data: None,
            token: None,
            worker_pins: vec![0; workers_per_host],
            pin_total: 0,
            doomed: false,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    blocks: HashMap<BlockId, BlockEntry>,
    lru: UnpinnedLru,
    swap: SwapIndex,
    budget: MemoryBudget,
    pins: PinTable,
    next_block: u64,
    tearing_down: bool,
}

impl PoolState {
    /// Count one pin for `worker` on an already-resident block and return
    /// the byte region for the handle.
    fn apply_pin(&mut self, id: BlockId, worker: WorkerId) -> BlockBytes {
        let entry = self.blocks.get_mut(&id).expect("pin target exists");
        entry.worker_pins[worker.0] += 1;
        entry.pin_total += 1;
        let size = entry.size;
        let data = entry.data.clone().expect("pinned block is resident");
        self.pins.increment(worker, size);
        data
    }

    fn check_invariants(&self) {
        #[cfg(debug_assertions)]
        self.check_invariants_inner();
    }

    #[cfg(debug_assertions)]
    fn check_invariants_inner(&self) {
        if self.tearing_down {
            return;
        }
        let workers = self.pins.worker_count();
        let mut ram = 0_usize;
        let mut writing_bytes = 0_usize;
        let mut pins_per_worker = vec![0_usize; workers];
        let mut bytes_per_worker = vec![0_usize; workers];

        for (id, entry) in &self.blocks {
            let per_worker_sum: u32 = entry.worker_pins.iter().sum();
            assert_eq!(per_worker_sum, entry.pin_total, "pin attribution drift on {id}");
            for (worker, count) in entry.worker_pins.iter().enumerate() {
                pins_per_worker[worker] += *count as usize;
                bytes_per_worker[worker] += *count as usize * entry.size;
            }

            let memberships = usize::from(self.lru.contains(*id))
                + usize::from(self.swap.writing.contains_key(id))
                + usize::from(self.swap.reading.contains_key(id))
                + usize::from(self.swap.swapped.contains(id));
            assert!(memberships <= 1, "{id} in more than one residency set");
            if entry.pin_total > 0 {
                assert_eq!(memberships, 0, "pinned {id} in a residency set");
                assert!(entry.data.is_some(), "pinned {id} without data");
            } else {
                assert_eq!(memberships, 1, "idle {id} in no residency set");
            }

            if entry.data.is_some() {
                ram += entry.size;
            }
            if self.swap.writing.contains_key(id) {
                assert!(entry.data.is_some(), "{id} writing without data");
                writing_bytes += entry.size;
            }
            if self.swap.swapped.contains(id) {
                assert!(entry.data.is_none(), "{id} swapped with data resident");
                assert!(entry.token.is_some(), "{id} swapped without a token");
            }
        }

        for (id, rs) in &self.swap.reading {
            let entry = self.blocks.get(id).expect("reading entry has a block");
            assert!(entry.data.is_none(), "{id} reading with data resident");
            if rs.ram_granted {
                ram += entry.size;
            }
        }

        assert_eq!(ram, self.budget.ram_used(), "ram accounting drift");
        assert_eq!(
            writing_bytes,
            self.budget.writing_bytes(),
            "writing accounting drift"
        );
        assert_eq!(
            pins_per_worker,
            self.pins.pins_per_worker(),
            "pin table drift"
        );
        assert_eq!(
            bytes_per_worker,
            self.pins.pinned_bytes_per_worker(),
            "pinned bytes drift"
        );
    }
}

type Resolutions = Vec<(PinPromise, Result<PinnedBlock>)>;

/// Resolve collected promises. Must run after the pool mutex is released:
/// resolving can drop a `PinnedBlock` whose destructor re-enters the pool.
fn resolve_all(resolutions: Resolutions) {
    for (promise, result) in resolutions {
        promise.resolve(result);
    }
}

fn admission_error_for_waiter(err: &PoolError) -> PoolError {
    match err {
        PoolError::BudgetRefused { bytes } => PoolError::BudgetRefused { bytes: *bytes },
        _ => PoolError::Cancelled,
    }
}

#[derive(Debug)]
pub(crate) struct PoolShared {
    weak_self: Weak<PoolShared>,
    device: Arc<dyn SwapDevice>,
    accountant: Arc<dyn RamAccountant>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Signalled on every release of RAM and every write completion;
    /// admission waits and the teardown drain sleep here.
    memory_change: Condvar,
}

impl PoolShared {
    fn check_worker(&self, worker: WorkerId) {
        assert!(
            worker.0 < self.config.workers_per_host,
            "worker id {} out of range (workers_per_host = {})",
            worker.0,
            self.config.workers_per_host
        );
    }

    fn make_pinned(&self, blk: BlockRef, bytes: BlockBytes, worker: WorkerId) -> PinnedBlock {
        PinnedBlock::new(self.weak_self.clone(), blk, bytes, worker)
    }

    fn release_ram(&self, state: &mut PoolState, bytes: usize) {
        state.budget.release(bytes);
        self.accountant.sub(bytes);
        self.memory_change.notify_all();
    }

    /// Admit `bytes` against the hard limit, waiting as long as necessary.
    /// On success the bytes are counted in `ram_used`.
    fn admit_ram(&self, state: &mut MutexGuard<'_, PoolState>, bytes: usize) -> Result<()> {
        state.budget.add_requested(bytes);
        loop {
            self.evict_under_pressure(&mut **state);
            if state.tearing_down {
                state.budget.remove_requested(bytes);
                return Err(PoolError::Cancelled);
            }
            if !state.budget.hard_blocked() {
                break;
            }
            trace!(
                target: "weir::pool",
                event = "admission_wait",
                bytes,
                ram_used = state.budget.ram_used(),
                requested = state.budget.requested_bytes()
            );
            self.memory_change.wait(state);
        }
        state.budget.remove_requested(bytes);
        match self.accountant.add(bytes) {
            Ok(()) => {
                state.budget.grant(bytes);
                Ok(())
            }
            Err(_refused) => {
                self.memory_change.notify_all();
                warn!(target: "weir::pool", event = "parent_budget_refused", bytes);
                Err(PoolError::BudgetRefused { bytes })
            }
        }
    }

    fn evict_under_pressure(&self, state: &mut PoolState) {
        while state.budget.under_pressure() && self.evict_one(state) {}
    }

    /// Evict the oldest unpinned block. Returns false when none is left.
    fn evict_one(&self, state: &mut PoolState) -> bool {
        let Some(id) = state.lru.pop_oldest() else {
            return false;
        };
        let entry = state.blocks.get_mut(&id).expect("unpinned block exists");
        let size = entry.size;
        let data = entry.data.clone().expect("unpinned block is resident");

        if entry.token.is_some() && !data.is_dirty() {
            // The stored copy still matches RAM: free synchronously.
            entry.data = None;
            state.swap.swapped.insert(id);
            self.release_ram(state, size);
            debug!(target: "weir::pool", event = "evict_clean", block = id.0, size);
            return true;
        }

        let stale = entry.token.take();
        if let Some(stale) = stale {
            self.device.discard(stale);
        }
        let ticket = self.device.submit_write(data, self.write_completion(id));
        state.swap.writing.insert(id, WriteState::new(ticket));
        state.budget.begin_write(size);
        debug!(target: "weir::pool", event = "evict_write", block = id.0, size);
        true
    }

    fn write_completion(&self, id: BlockId) -> WriteCompletion {
        let weak = self.weak_self.clone();
        Box::new(move |outcome| {
            if let Some(pool) = weak.upgrade() {
                pool.on_write_complete(id, outcome);
            }
        })
    }

    fn read_completion(&self, id: BlockId) -> ReadCompletion {
        let weak = self.weak_self.clone();
        Box::new(move |outcome| {
            if let Some(pool) = weak.upgrade() {
                pool.on_read_complete(id, outcome);
            }
        })
    }

    fn allocate(&self, size: usize, worker: WorkerId) -> Result<PinnedBlock> {
        self.check_worker(worker);
        let mut state = self.state.lock();
        self.admit_ram(&mut state, size)?;

        let id = BlockId(state.next_block);
        state.next_block += 1;
        let data = BlockBytes::zeroed(size);
        let mut entry = BlockEntry::new(size, self.config.workers_per_host);
        entry.data = Some(data.clone());
        entry.worker_pins[worker.0] = 1;
        entry.pin_total = 1;
        state.blocks.insert(id, entry);
        state.pins.increment(worker, size);
        debug!(
            target: "weir::pool",
            event = "allocate",
            block = id.0,
            size,
            worker = worker.0,
            ram_used = state.budget.ram_used()
        );
        state.check_invariants();
        drop(state);

        let blk = BlockRef::new(self.weak_self.clone(), id, size);
        Ok(self.make_pinned(blk, data, worker))
    }

    fn pin(&self, block: &BlockRef, worker: WorkerId) -> PinFuture {
        self.check_worker(worker);
        let (promise, future) = pin_channel();
        let mut resolutions = Resolutions::new();
        {
            let mut state = self.state.lock();
            self.pin_locked(&mut state, block, worker, promise, &mut resolutions);
            state.check_invariants();
        }
        resolve_all(resolutions);
        future
    }

    fn pin_locked(
        &self,
        state: &mut MutexGuard<'_, PoolState>,
        block: &BlockRef,
        worker: WorkerId,
        promise: PinPromise,
        resolutions: &mut Resolutions,
    ) {
        let id = block.id();
        let entry = state.blocks.get(&id).expect("pin target is alive");
        debug_assert!(!entry.doomed, "pin of doomed {id}");
        let size = entry.size;

        // Resident, whether currently pinned or idle in the unpinned set.
        if entry.pin_total > 0 || state.lru.contains(id) {
            state.lru.remove(id);
            let data = state.apply_pin(id, worker);
            trace!(target: "weir::pool", event = "pin_hit", block = id.0, worker = worker.0);
            resolutions.push((promise, Ok(self.make_pinned(block.clone(), data, worker))));
            return;
        }

        // Being written out: rescue it.
        if state.swap.writing.contains_key(&id) {
            let cancelled = state
                .swap
                .writing
                .get(&id)
                .expect("checked above")
                .ticket
                .try_cancel();
            if cancelled {
                state.swap.writing.remove(&id);
                state.budget.end_write(size);
                let data = state.apply_pin(id, worker);
                debug!(
                    target: "weir::pool",
                    event = "pin_rescue_cancelled_write",
                    block = id.0,
                    worker = worker.0
                );
                resolutions.push((promise, Ok(self.make_pinned(block.clone(), data, worker))));
            } else {
                let ws = state.swap.writing.get_mut(&id).expect("checked above");
                if ws.blk.is_none() {
                    ws.blk = Some(block.downgrade());
                }
                ws.rescues.push(RescueWaiter { worker, promise });
                debug!(
                    target: "weir::pool",
                    event = "pin_waits_for_write",
                    block = id.0,
                    worker = worker.0
                );
            }
            return;
        }

        // Already being read back: join the existing request.
        if let Some(rs) = state.swap.reading.get_mut(&id) {
            rs.waiters.push(ReadWaiter { worker, promise });
            trace!(target: "weir::pool", event = "pin_joins_read", block = id.0, worker = worker.0);
            return;
        }

        // On the device only: swap it in. The reading record is staged
        // before the admission wait so concurrent pins of the same block
        // attach to it instead of issuing a second read.
        if state.swap.swapped.remove(&id) {
            state.swap.reading.insert(
                id,
                ReadState {
                    ticket: RequestTicket::new(),
                    blk: block.downgrade(),
                    waiters: vec![ReadWaiter { worker, promise }],
                    ram_granted: false,
                },
            );
            debug!(
                target: "weir::pool",
                event = "pin_fault",
                block = id.0,
                worker = worker.0,
                size
            );
            match self.admit_ram(state, size) {
                Ok(()) => {
                    if state.swap.reading.contains_key(&id) {
                        let token = state
                            .blocks
                            .get(&id)
                            .expect("reading block exists")
                            .token
                            .expect("swapped block has a token");
                        let ticket = self.device.submit_read(token, size, self.read_completion(id));
                        let rs = state.swap.reading.get_mut(&id).expect("checked above");
                        rs.ram_granted = true;
                        rs.ticket = ticket;
                    } else {
                        // The record vanished while we waited (teardown);
                        // its waiters were already failed there.
                        self.release_ram(&mut **state, size);
                    }
                }
                Err(err) => {
                    if let Some(rs) = state.swap.reading.remove(&id) {
                        state.swap.swapped.insert(id);
                        for waiter in rs.waiters {
                            resolutions
                                .push((waiter.promise, Err(admission_error_for_waiter(&err))));
                        }
                    }
                }
            }
            return;
        }

        unreachable!("{id} in no residency state during pin");
    }

    pub(crate) fn increment_pin(&self, id: BlockId, worker: WorkerId) {
        let mut state = self.state.lock();
        let entry = state.blocks.get(&id).expect("increment_pin target is alive");
        assert!(entry.pin_total > 0, "increment_pin on unpinned {id}");
        let _ = state.apply_pin(id, worker);
        state.check_invariants();
    }

    pub(crate) fn decrement_pin(&self, id: BlockId, worker: WorkerId) {
        let mut state = self.state.lock();
        let Some(entry) = state.blocks.get_mut(&id) else {
            // Handle outlived pool teardown.
            return;
        };
        let size = entry.size;
        assert!(
            entry.worker_pins[worker.0] > 0,
            "unpin without a pin for worker {} on {id}",
            worker.0
        );
        entry.worker_pins[worker.0] -= 1;
        entry.pin_total -= 1;
        let now_idle = entry.pin_total == 0;
        state.pins.decrement(worker, size);
        if now_idle {
            state.lru.insert(id);
            trace!(target: "weir::pool", event = "unpin_idle", block = id.0);
            self.evict_under_pressure(&mut state);
        }
        state.check_invariants();
    }

    /// Reclaim a block once its last handle dropped. Legal from every
    /// unpinned residency state; in-flight I/O is cancelled best-effort.
    pub(crate) fn destroy(&self, id: BlockId) {
        let mut resolutions = Resolutions::new();
        {
            let mut state = self.state.lock();
            let Some(entry) = state.blocks.get(&id) else {
                // Torn down or reclaimed by a late completion already.
                return;
            };
            assert!(entry.pin_total == 0, "destroy of pinned {id}");
            let size = entry.size;

            if state.swap.writing.contains_key(&id) {
                let cancelled = state
                    .swap
                    .writing
                    .get(&id)
                    .expect("checked above")
                    .ticket
                    .try_cancel();
                if cancelled {
                    let ws = state.swap.writing.remove(&id).expect("checked above");
                    for waiter in ws.rescues {
                        resolutions.push((waiter.promise, Err(PoolError::Cancelled)));
                    }
                    state.budget.end_write(size);
                    let entry = state.blocks.remove(&id).expect("checked above");
                    if let Some(token) = entry.token {
                        self.device.discard(token);
                    }
                    self.release_ram(&mut state, size);
                    debug!(target: "weir::pool", event = "destroy", block = id.0, from = "writing");
                } else {
                    state.blocks.get_mut(&id).expect("checked above").doomed = true;
                    debug!(target: "weir::pool", event = "destroy_deferred", block = id.0);
                }
            } else if let Some(rs) = state.swap.reading.remove(&id) {
                rs.ticket.try_cancel();
                for waiter in rs.waiters {
                    resolutions.push((waiter.promise, Err(PoolError::Cancelled)));
                }
                if rs.ram_granted {
                    self.release_ram(&mut state, size);
                }
                let entry = state.blocks.remove(&id).expect("reading block exists");
                if let Some(token) = entry.token {
                    self.device.discard(token);
                }
                debug!(target: "weir::pool", event = "destroy", block = id.0, from = "reading");
            } else if state.swap.swapped.remove(&id) {
                let entry = state.blocks.remove(&id).expect("swapped block exists");
                if let Some(token) = entry.token {
                    self.device.discard(token);
                }
                debug!(target: "weir::pool", event = "destroy", block = id.0, from = "swapped");
            } else {
                let removed = state.lru.remove(id);
                debug_assert!(removed, "resident idle block must be in the unpinned set");
                let entry = state.blocks.remove(&id).expect("resident block exists");
                debug_assert!(entry.data.is_some());
                if let Some(token) = entry.token {
                    self.device.discard(token);
                }
                self.release_ram(&mut state, size);
                debug!(target: "weir::pool", event = "destroy", block = id.0, from = "resident");
            }
            state.check_invariants();
        }
        resolve_all(resolutions);
    }

    fn on_write_complete(&self, id: BlockId, outcome: WriteOutcome) {
        let mut resolutions = Resolutions::new();
        {
            let mut state = self.state.lock();
            let Some(ws) = state.swap.writing.remove(&id) else {
                // Cancellation removed the record; a straggler completion
                // can only leak its token, so drop that.
                if let WriteOutcome::Stored(token) = outcome {
                    self.device.discard(token);
                }
                return;
            };
            let size = state.blocks.get(&id).expect("writing block exists").size;
            state.budget.end_write(size);

            if state.blocks.get(&id).expect("checked above").doomed {
                if let WriteOutcome::Stored(token) = outcome {
                    self.device.discard(token);
                }
                for waiter in ws.rescues {
                    resolutions.push((waiter.promise, Err(PoolError::Cancelled)));
                }
                let entry = state.blocks.remove(&id).expect("checked above");
                if let Some(token) = entry.token {
                    self.device.discard(token);
                }
                self.release_ram(&mut state, size);
                debug!(target: "weir::pool", event = "destroy_completed", block = id.0);
            } else if !ws.rescues.is_empty() {
                // Rescued while the write ran. RAM stays authoritative and
                // a token minted now is dropped: the rescuer may write, so
                // the stored copy cannot be reused.
                if let WriteOutcome::Stored(token) = outcome {
                    self.device.discard(token);
                }
                match ws.blk.as_ref().and_then(WeakBlockRef::upgrade) {
                    Some(blk) => {
                        let waiters = ws.rescues.len();
                        for waiter in ws.rescues {
                            let data = state.apply_pin(id, waiter.worker);
                            resolutions.push((
                                waiter.promise,
                                Ok(self.make_pinned(blk.clone(), data, waiter.worker)),
                            ));
                        }
                        debug!(
                            target: "weir::pool",
                            event = "pin_rescued_after_write",
                            block = id.0,
                            waiters
                        );
                    }
                    None => {
                        // Every handle vanished while the write ran; the
                        // destroy behind them reclaims the resident copy.
                        for waiter in ws.rescues {
                            resolutions.push((waiter.promise, Err(PoolError::Cancelled)));
                        }
                        state.lru.insert(id);
                    }
                }
            } else {
                match outcome {
                    WriteOutcome::Stored(token) => {
                        let entry = state.blocks.get_mut(&id).expect("checked above");
                        entry.data = None;
                        let stale = entry.token.replace(token);
                        debug_assert!(stale.is_none(), "evicted block already had a token");
                        state.swap.swapped.insert(id);
                        self.release_ram(&mut state, size);
                        debug!(
                            target: "weir::pool",
                            event = "evict_done",
                            block = id.0,
                            size,
                            ram_used = state.budget.ram_used()
                        );
                    }
                    WriteOutcome::Failed => {
                        // Keep the block; pressure will retry it.
                        state.lru.insert(id);
                        warn!(target: "weir::pool", event = "evict_write_failed", block = id.0, size);
                    }
                }
            }
            self.memory_change.notify_all();
            state.check_invariants();
        }
        resolve_all(resolutions);
    }

    fn on_read_complete(&self, id: BlockId, outcome: ReadOutcome) {
        let mut resolutions = Resolutions::new();
        {
            let mut state = self.state.lock();
            let Some(rs) = state.swap.reading.remove(&id) else {
                // Destroyed or torn down while the read ran; accounting was
                // unwound there and the bytes are simply dropped.
                return;
            };
            debug_assert!(rs.ram_granted, "read completed before admission");
            let size = state.blocks.get(&id).expect("reading block exists").size;

            match outcome {
                ReadOutcome::Loaded(bytes) => {
                    debug_assert_eq!(bytes.len(), size);
                    let data = BlockBytes::loaded(bytes);
                    state.blocks.get_mut(&id).expect("checked above").data = Some(data);
                    match rs.blk.upgrade() {
                        Some(blk) => {
                            let waiters = rs.waiters.len();
                            for waiter in rs.waiters {
                                let data = state.apply_pin(id, waiter.worker);
                                resolutions.push((
                                    waiter.promise,
                                    Ok(self.make_pinned(blk.clone(), data, waiter.worker)),
                                ));
                            }
                            debug!(
                                target: "weir::pool",
                                event = "swap_in_done",
                                block = id.0,
                                size,
                                waiters
                            );
                        }
                        None => {
                            for waiter in rs.waiters {
                                resolutions.push((waiter.promise, Err(PoolError::Cancelled)));
                            }
                            state.lru.insert(id);
                        }
                    }
                }
                ReadOutcome::Failed => {
                    self.release_ram(&mut state, size);
                    state.swap.swapped.insert(id);
                    for waiter in rs.waiters {
                        resolutions.push((waiter.promise, Err(PoolError::SwapRead { block: id.0 })));
                    }
                    warn!(target: "weir::pool", event = "swap_in_failed", block = id.0, size);
                }
            }
            self.memory_change.notify_all();
            state.check_invariants();
        }
        resolve_all(resolutions);
    }

    /// Drain in-flight I/O, fail pending pins, reclaim every surviving
    /// block, and verify the zero state.
    fn teardown(&self) {
        let mut resolutions = Resolutions::new();
        {
            let mut state = self.state.lock();
            if state.tearing_down {
                return;
            }
            state.tearing_down = true;
            info!(
                target: "weir::pool",
                event = "pool_teardown",
                blocks = state.blocks.len(),
                writing = state.swap.writing.len(),
                reading = state.swap.reading.len()
            );

            // Pending swap-ins are failed outright.
            let reading: Vec<(BlockId, ReadState)> = state.swap.reading.drain().collect();
            for (id, rs) in reading {
                rs.ticket.try_cancel();
                if rs.ram_granted {
                    let size = state.blocks.get(&id).expect("reading block exists").size;
                    self.release_ram(&mut state, size);
                }
                for waiter in rs.waiters {
                    resolutions.push((waiter.promise, Err(PoolError::Cancelled)));
                }
            }

            // Queued eviction writes are cancelled; running ones drain.
            let writing_ids: Vec<BlockId> = state.swap.writing.keys().copied().collect();
            for id in writing_ids {
                let cancelled = state
                    .swap
                    .writing
                    .get(&id)
                    .expect("listed above")
                    .ticket
                    .try_cancel();
                if cancelled {
                    let ws = state.swap.writing.remove(&id).expect("listed above");
                    let size = state.blocks.get(&id).expect("writing block exists").size;
                    state.budget.end_write(size);
                    for waiter in ws.rescues {
                        resolutions.push((waiter.promise, Err(PoolError::Cancelled)));
                    }
                }
            }
            while !state.swap.writing.is_empty() {
                self.memory_change.wait(&mut state);
            }

            // Reclaim whatever survived the drain.
            let ids: Vec<BlockId> = state.blocks.keys().copied().collect();
            for id in ids {
                let entry = state.blocks.remove(&id).expect("listed above");
                if entry.data.is_some() {
                    self.release_ram(&mut state, entry.size);
                }
                if let Some(token) = entry.token {
                    self.device.discard(token);
                }
            }
            state.lru.clear();
            state.swap.swapped.clear();

            state.pins.assert_zero();
            assert_eq!(state.budget.ram_used(), 0, "ram accounting nonzero at teardown");
            assert_eq!(
                state.budget.writing_bytes(),
                0,
                "writing bytes nonzero at teardown"
            );
            self.memory_change.notify_all();
        }
        resolve_all(resolutions);
    }
}

/// Host-local pool of byte blocks shared by all workers on the host.
///
/// Allocation returns a block pinned for the allocating worker. Unpinned
/// blocks are evicted to the swap device under memory pressure and read
/// back on demand when pinned again. All bookkeeping lives behind one
/// mutex; see the module docs for the residency state machine.
///
/// Dropping the pool cancels pending swap-ins (their waiters observe
/// `Cancelled`), waits for in-flight writes to finish, and asserts that
/// every pin was released.
#[derive(Debug)]
pub struct BlockPool {
    shared: Arc<PoolShared>,
}

impl BlockPool {
    pub fn new(
        config: PoolConfig,
        device: Arc<dyn SwapDevice>,
        accountant: Arc<dyn RamAccountant>,
    ) -> Result<Self> {
        let config = config.validate()?;
        let shared = Arc::new_cyclic(|weak_self| PoolShared {
            weak_self: weak_self.clone(),
            device,
            accountant,
            config,
            state: Mutex::new(PoolState {
                blocks: HashMap::new(),
                lru: UnpinnedLru::default(),
                swap: SwapIndex::default(),
                budget: MemoryBudget::new(config.soft_ram_limit, config.hard_ram_limit),
                pins: PinTable::new(config.workers_per_host),
                next_block: 1,
                tearing_down: false,
            }),
            memory_change: Condvar::new(),
        });
        info!(
            target: "weir::pool",
            event = "pool_created",
            soft_ram_limit = config.soft_ram_limit,
            hard_ram_limit = config.hard_ram_limit,
            workers_per_host = config.workers_per_host
        );
        Ok(Self { shared })
    }

    /// Pool for tests: no limits, in-memory swap device, no parent
    /// accountant.
    #[must_use]
    pub fn new_for_tests(workers_per_host: usize) -> Self {
        Self::new(
            PoolConfig::unlimited(workers_per_host),
            Arc::new(MemSwapDevice::new()),
            Arc::new(NoopRamAccountant),
        )
        .expect("unlimited config is valid")
    }

    /// Allocate a zero-filled block of `size` bytes, pinned for `worker`.
    ///
    /// Blocks while the hard limit is exceeded; fails only if the parent
    /// accountant refuses the bytes.
    pub fn allocate(&self, size: usize, worker: WorkerId) -> Result<PinnedBlock> {
        self.shared.allocate(size, worker)
    }

    /// Pin a block for `worker`, swapping it in if required.
    ///
    /// Resolves immediately for resident blocks; a block on the device
    /// resolves once its read completes. Concurrent pins of one swapped
    /// block share a single read.
    pub fn pin(&self, block: &BlockRef, worker: WorkerId) -> PinFuture {
        self.shared.pin(block, worker)
    }

    #[must_use]
    pub fn workers_per_host(&self) -> usize {
        self.shared.config.workers_per_host
    }

    /// Number of live blocks, in any residency state.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.shared.state.lock().blocks.len()
    }

    /// Bytes resident in RAM (pinned, idle, writing out, or being read in).
    #[must_use]
    pub fn total_ram_use(&self) -> usize {
        self.shared.state.lock().budget.ram_used()
    }

    #[must_use]
    pub fn writing_bytes(&self) -> usize {
        self.shared.state.lock().budget.writing_bytes()
    }

    #[must_use]
    pub fn requested_bytes(&self) -> usize {
        self.shared.state.lock().budget.requested_bytes()
    }

    #[must_use]
    pub fn total_pins(&self) -> usize {
        self.shared.state.lock().pins.total_pins()
    }

    #[must_use]
    pub fn total_pinned_bytes(&self) -> usize {
        self.shared.state.lock().pins.total_pinned_bytes()
    }

    #[must_use]
    pub fn num_swapped_blocks(&self) -> usize {
        self.shared.state.lock().swap.swapped.len()
    }

    #[must_use]
    pub fn pins_per_worker(&self) -> Vec<usize> {
        self.shared.state.lock().pins.pins_per_worker()
    }

    #[must_use]
    pub fn pinned_bytes_per_worker(&self) -> Vec<usize> {
        self.shared.state.lock().pins.pinned_bytes_per_worker()
    }

    /// Snapshot every counter under one brief lock.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let state = self.shared.state.lock();
        PoolMetrics {
            block_count: state.blocks.len(),
            total_ram_use: state.budget.ram_used(),
            writing_bytes: state.budget.writing_bytes(),
            requested_bytes: state.budget.requested_bytes(),
            unpinned_blocks: state.lru.len(),
            num_writing_blocks: state.swap.writing.len(),
            num_reading_blocks: state.swap.reading.len(),
            num_swapped_blocks: state.swap.swapped.len(),
            total_pins: state.pins.total_pins(),
            total_pinned_bytes: state.pins.total_pinned_bytes(),
            max_pins: state.pins.max_pins(),
            max_pinned_bytes: state.pins.max_pinned_bytes(),
            pins_per_worker: state.pins.pins_per_worker(),
            pinned_bytes_per_worker: state.pins.pinned_bytes_per_worker(),
        }
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}
