//! Insertion-ordered set of in-RAM, unpinned blocks.
//!
//! Eviction victims come off the old end. A monotonic sequence number per
//! insertion gives oldest-first order in the `BTreeSet` while the `HashMap`
//! side allows O(log n) removal by identity when a block is re-pinned.

use std::collections::{BTreeSet, HashMap};
use weir_types::BlockId;

#[derive(Debug, Default)]
pub(crate) struct UnpinnedLru {
    next_seq: u64,
    by_block: HashMap<BlockId, u64>,
    by_age: BTreeSet<(u64, BlockId)>,
}

impl UnpinnedLru {
    /// Insert at the most-recently-unpinned end.
    pub(crate) fn insert(&mut self, block: BlockId) {
        debug_assert!(
            !self.by_block.contains_key(&block),
            "{block} already in unpinned set"
        );
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_block.insert(block, seq);
        self.by_age.insert((seq, block));
    }

    /// Remove by identity; true if the block was present.
    pub(crate) fn remove(&mut self, block: BlockId) -> bool {
        match self.by_block.remove(&block) {
            Some(seq) => {
                let removed = self.by_age.remove(&(seq, block));
                debug_assert!(removed);
                true
            }
            None => false,
        }
    }

    /// Pop the oldest unpinned block, if any.
    pub(crate) fn pop_oldest(&mut self) -> Option<BlockId> {
        let (seq, block) = *self.by_age.iter().next()?;
        self.by_age.remove(&(seq, block));
        self.by_block.remove(&block);
        Some(block)
    }

    pub(crate) fn contains(&self, block: BlockId) -> bool {
        self.by_block.contains_key(&block)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_block.len()
    }

    pub(crate) fn clear(&mut self) {
        self.by_block.clear();
        self.by_age.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pops_in_insertion_order() {
        let mut lru = UnpinnedLru::default();
        for id in [3, 1, 2] {
            lru.insert(BlockId(id));
        }
        assert_eq!(lru.pop_oldest(), Some(BlockId(3)));
        assert_eq!(lru.pop_oldest(), Some(BlockId(1)));
        assert_eq!(lru.pop_oldest(), Some(BlockId(2)));
        assert_eq!(lru.pop_oldest(), None);
    }

    #[test]
    fn reinsert_moves_to_young_end() {
        let mut lru = UnpinnedLru::default();
        lru.insert(BlockId(1));
        lru.insert(BlockId(2));
        assert!(lru.remove(BlockId(1)));
        lru.insert(BlockId(1));
        assert_eq!(lru.pop_oldest(), Some(BlockId(2)));
        assert_eq!(lru.pop_oldest(), Some(BlockId(1)));
    }

    #[test]
    fn remove_of_absent_block_is_noop() {
        let mut lru = UnpinnedLru::default();
        lru.insert(BlockId(7));
        assert!(!lru.remove(BlockId(8)));
        assert!(lru.contains(BlockId(7)));
        assert_eq!(lru.len(), 1);
    }

    proptest! {
        /// Whatever interleaving of inserts and removals happens, the pop
        /// sequence is exactly the surviving inserts, oldest first.
        #[test]
        fn pop_order_matches_surviving_inserts(
            inserts in proptest::collection::vec(0_u64..32, 1..32),
            removals in proptest::collection::vec(0_u64..32, 0..16)
        ) {
            let mut lru = UnpinnedLru::default();
            let mut expected: Vec<BlockId> = Vec::new();
            for id in inserts {
                let block = BlockId(id);
                if !lru.contains(block) {
                    lru.insert(block);
                    expected.push(block);
                }
            }
            for id in removals {
                let block = BlockId(id);
                if lru.remove(block) {
                    expected.retain(|b| *b != block);
                }
            }
            let mut popped = Vec::new();
            while let Some(block) = lru.pop_oldest() {
                popped.push(block);
            }
            prop_assert_eq!(popped, expected);
            prop_assert_eq!(lru.len(), 0);
        }
    }
}
