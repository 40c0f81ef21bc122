//! In-flight swap state: which blocks are being written out, which are
//! being read back, and which live only on the device.

use crate::future::PinPromise;
use crate::handle::WeakBlockRef;
use std::collections::{HashMap, HashSet};
use weir_store::RequestTicket;
use weir_types::{BlockId, WorkerId};

/// A pin that arrived while its block was being written out and could not
/// cancel the write; it resolves when the write completes.
#[derive(Debug)]
pub(crate) struct RescueWaiter {
    pub(crate) worker: WorkerId,
    pub(crate) promise: PinPromise,
}

/// One eviction write in flight.
#[derive(Debug)]
pub(crate) struct WriteState {
    pub(crate) ticket: RequestTicket,
    /// Pins accumulated after cancellation failed; resolved at completion.
    pub(crate) rescues: Vec<RescueWaiter>,
    /// Set with the first rescue; used to mint handles at completion.
    pub(crate) blk: Option<WeakBlockRef>,
}

impl WriteState {
    pub(crate) fn new(ticket: RequestTicket) -> Self {
        Self {
            ticket,
            rescues: Vec::new(),
            blk: None,
        }
    }
}

/// A pin waiting on a swap-in read.
#[derive(Debug)]
pub(crate) struct ReadWaiter {
    pub(crate) worker: WorkerId,
    pub(crate) promise: PinPromise,
}

/// One swap-in read, possibly still waiting for RAM admission.
///
/// The record is inserted before admission so that concurrent pins of the
/// same block attach here instead of issuing a second read.
#[derive(Debug)]
pub(crate) struct ReadState {
    pub(crate) ticket: RequestTicket,
    pub(crate) blk: WeakBlockRef,
    pub(crate) waiters: Vec<ReadWaiter>,
    /// False until the admission wait finished and the buffer bytes joined
    /// `ram_used`.
    pub(crate) ram_granted: bool,
}

/// The three swap-side residency maps, keyed by block identity.
#[derive(Debug, Default)]
pub(crate) struct SwapIndex {
    pub(crate) writing: HashMap<BlockId, WriteState>,
    pub(crate) reading: HashMap<BlockId, ReadState>,
    pub(crate) swapped: HashSet<BlockId>,
}
