//! User-facing block handles.
//!
//! Two flavors: [`BlockRef`] carries identity only and is cheap to clone;
//! [`PinnedBlock`] additionally owns one pin for one worker and is the only
//! way to reach the block's bytes. Both re-enter the pool on drop — the
//! last `BlockRef` destroys the block, each `PinnedBlock` releases its pin.
//! The back-references are weak: the pool never owns a handle, and handles
//! outliving the pool degrade to no-ops.

use crate::pool::PoolShared;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::{Arc, Weak};
use weir_types::{BlockBytes, BlockId, WorkerId};

#[derive(Debug)]
pub(crate) struct BlockToken {
    pool: Weak<PoolShared>,
    id: BlockId,
    size: usize,
}

impl Drop for BlockToken {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.destroy(self.id);
        }
    }
}

/// Reference to a block, independent of its residency.
///
/// Clones share one token; when the last clone (and the last
/// [`PinnedBlock`], which holds one internally) is gone, the block is
/// destroyed.
#[derive(Debug, Clone)]
pub struct BlockRef {
    token: Arc<BlockToken>,
}

impl BlockRef {
    pub(crate) fn new(pool: Weak<PoolShared>, id: BlockId, size: usize) -> Self {
        Self {
            token: Arc::new(BlockToken { pool, id, size }),
        }
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.token.id
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.token.size
    }

    pub(crate) fn downgrade(&self) -> WeakBlockRef {
        WeakBlockRef(Arc::downgrade(&self.token))
    }
}

/// Weak counterpart used by in-flight swap records, so that a pending read
/// or write never keeps a block alive by itself.
#[derive(Debug, Clone)]
pub(crate) struct WeakBlockRef(Weak<BlockToken>);

impl WeakBlockRef {
    pub(crate) fn upgrade(&self) -> Option<BlockRef> {
        self.0.upgrade().map(|token| BlockRef { token })
    }
}

/// A pinned block: identity plus borrowed access to the byte region,
/// owning one pin attributed to `worker`.
///
/// The region is valid for exactly as long as this handle lives; the pool
/// will not move or reclaim it. Cloning takes another pin for the same
/// worker. Dropping releases the pin, which may make the block evictable.
pub struct PinnedBlock {
    pool: Weak<PoolShared>,
    blk: BlockRef,
    bytes: BlockBytes,
    worker: WorkerId,
}

impl PinnedBlock {
    pub(crate) fn new(
        pool: Weak<PoolShared>,
        blk: BlockRef,
        bytes: BlockBytes,
        worker: WorkerId,
    ) -> Self {
        Self {
            pool,
            blk,
            bytes,
            worker,
        }
    }

    #[must_use]
    pub fn block(&self) -> &BlockRef {
        &self.blk
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.blk.id()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.blk.size()
    }

    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Shared read access to the block bytes. No pool lock is taken.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.bytes.read()
    }

    /// Exclusive write access to the block bytes. No pool lock is taken;
    /// the region is marked dirty so a stale swap copy is never reused.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.bytes.write()
    }

    /// The shared byte region itself.
    #[must_use]
    pub fn bytes(&self) -> &BlockBytes {
        &self.bytes
    }

    /// Release the pin but keep a reference to the block.
    #[must_use]
    pub fn unpin(self) -> BlockRef {
        self.blk.clone()
    }
}

impl Clone for PinnedBlock {
    fn clone(&self) -> Self {
        if let Some(pool) = self.pool.upgrade() {
            pool.increment_pin(self.blk.id(), self.worker);
        }
        Self {
            pool: self.pool.clone(),
            blk: self.blk.clone(),
            bytes: self.bytes.clone(),
            worker: self.worker,
        }
    }
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.decrement_pin(self.blk.id(), self.worker);
        }
    }
}

impl fmt::Debug for PinnedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBlock")
            .field("id", &self.blk.id())
            .field("size", &self.blk.size())
            .field("worker", &self.worker.0)
            .finish_non_exhaustive()
    }
}
