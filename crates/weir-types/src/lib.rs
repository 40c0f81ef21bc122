#![forbid(unsafe_code)]
//! Shared identifiers for the weir block pool.
//!
//! Defines the newtypes that cross crate boundaries (`BlockId`, `WorkerId`,
//! `SwapToken`) and [`BlockBytes`], the shared byte region behind every
//! in-RAM block.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stable identity of a block for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// Index of a worker thread on this host, in `[0, workers_per_host)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

/// Opaque token naming a block's copy on the swap device.
///
/// Minted by the device on first write and never interpreted by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwapToken(pub u64);

#[derive(Debug)]
struct BytesInner {
    bytes: RwLock<Vec<u8>>,
    dirty: AtomicBool,
}

/// Shared, clonable byte region of an in-RAM block.
///
/// All clones alias the same storage. Readers take the read lock; [`write`]
/// takes the write lock and marks the region dirty, which tells the pool
/// that any copy held on the swap device no longer matches RAM.
///
/// Invariant: length is fixed at creation and never changes.
///
/// [`write`]: BlockBytes::write
#[derive(Debug, Clone)]
pub struct BlockBytes {
    inner: Arc<BytesInner>,
    len: usize,
}

impl BlockBytes {
    /// Fresh zero-filled region for a newly allocated block.
    ///
    /// Starts dirty: there is no swap copy these bytes could match.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            inner: Arc::new(BytesInner {
                bytes: RwLock::new(vec![0_u8; len]),
                dirty: AtomicBool::new(true),
            }),
            len,
        }
    }

    /// Region materialized from a completed swap-in read.
    ///
    /// Starts clean: the bytes are exactly the stored copy.
    #[must_use]
    pub fn loaded(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            inner: Arc::new(BytesInner {
                bytes: RwLock::new(bytes),
                dirty: AtomicBool::new(false),
            }),
            len,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shared read access to the bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.inner.bytes.read()
    }

    /// Exclusive write access to the bytes; marks the region dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.inner.dirty.store(true, Ordering::Release);
        self.inner.bytes.write()
    }

    /// Whether the region has been written since it last matched a swap copy.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// True if both handles alias the same storage.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}
