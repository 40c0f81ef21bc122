//! Per-worker pin accounting.
//!
//! Dense arrays indexed by worker id plus scalar totals, so the hot
//! pin/unpin path touches one slot and one scalar each instead of a
//! contended global. Leaks show up attributed to a worker.

use std::fmt;
use weir_types::WorkerId;

#[derive(Debug)]
pub(crate) struct PinTable {
    pin_count: Vec<usize>,
    pinned_bytes: Vec<usize>,
    total_pins: usize,
    total_pinned_bytes: usize,
    max_pins: usize,
    max_pinned_bytes: usize,
}

impl PinTable {
    pub(crate) fn new(workers_per_host: usize) -> Self {
        Self {
            pin_count: vec![0; workers_per_host],
            pinned_bytes: vec![0; workers_per_host],
            total_pins: 0,
            total_pinned_bytes: 0,
            max_pins: 0,
            max_pinned_bytes: 0,
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.pin_count.len()
    }

    pub(crate) fn increment(&mut self, worker: WorkerId, size: usize) {
        self.pin_count[worker.0] += 1;
        self.pinned_bytes[worker.0] += size;
        self.total_pins += 1;
        self.total_pinned_bytes += size;
        self.max_pins = self.max_pins.max(self.total_pins);
        self.max_pinned_bytes = self.max_pinned_bytes.max(self.total_pinned_bytes);
    }

    pub(crate) fn decrement(&mut self, worker: WorkerId, size: usize) {
        assert!(
            self.pin_count[worker.0] > 0,
            "pin decrement below zero for worker {}",
            worker.0
        );
        assert!(
            self.pinned_bytes[worker.0] >= size,
            "pinned-bytes decrement below zero for worker {}",
            worker.0
        );
        self.pin_count[worker.0] -= 1;
        self.pinned_bytes[worker.0] -= size;
        self.total_pins -= 1;
        self.total_pinned_bytes -= size;
    }

    /// Teardown check: every counter must have returned to zero.
    pub(crate) fn assert_zero(&self) {
        assert_eq!(self.total_pins, 0, "pins leaked at pool teardown: {self}");
        assert_eq!(
            self.total_pinned_bytes, 0,
            "pinned bytes leaked at pool teardown: {self}"
        );
        for (worker, count) in self.pin_count.iter().enumerate() {
            assert_eq!(*count, 0, "worker {worker} leaked pins: {self}");
        }
    }

    pub(crate) fn total_pins(&self) -> usize {
        self.total_pins
    }

    pub(crate) fn total_pinned_bytes(&self) -> usize {
        self.total_pinned_bytes
    }

    pub(crate) fn max_pins(&self) -> usize {
        self.max_pins
    }

    pub(crate) fn max_pinned_bytes(&self) -> usize {
        self.max_pinned_bytes
    }

    pub(crate) fn pins_per_worker(&self) -> Vec<usize> {
        self.pin_count.clone()
    }

    pub(crate) fn pinned_bytes_per_worker(&self) -> Vec<usize> {
        self.pinned_bytes.clone()
    }
}

impl fmt::Display for PinTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total_pins={} total_pinned_bytes={} max_pins={} max_pinned_bytes={} pins={:?}",
            self.total_pins, self.total_pinned_bytes, self.max_pins, self.max_pinned_bytes,
            self.pin_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn increment_decrement_roundtrip() {
        let mut pins = PinTable::new(2);
        pins.increment(WorkerId(0), 1024);
        pins.increment(WorkerId(1), 512);
        assert_eq!(pins.total_pins(), 2);
        assert_eq!(pins.total_pinned_bytes(), 1536);
        assert_eq!(pins.pins_per_worker(), vec![1, 1]);

        pins.decrement(WorkerId(0), 1024);
        pins.decrement(WorkerId(1), 512);
        pins.assert_zero();
        assert_eq!(pins.max_pins(), 2);
        assert_eq!(pins.max_pinned_bytes(), 1536);
    }

    #[test]
    #[should_panic(expected = "pin decrement below zero")]
    fn decrement_without_pin_is_fatal() {
        let mut pins = PinTable::new(1);
        pins.decrement(WorkerId(0), 64);
    }

    #[test]
    #[should_panic(expected = "pins leaked")]
    fn assert_zero_catches_leaks() {
        let mut pins = PinTable::new(1);
        pins.increment(WorkerId(0), 64);
        pins.assert_zero();
    }

    proptest! {
        #[test]
        fn totals_equal_per_worker_sums(
            ops in proptest::collection::vec((0_usize..4, 1_usize..4096), 0..64)
        ) {
            let mut pins = PinTable::new(4);
            let mut live: Vec<(usize, usize)> = Vec::new();
            for (worker, size) in ops {
                pins.increment(WorkerId(worker), size);
                live.push((worker, size));
            }
            prop_assert_eq!(pins.total_pins(), live.len());
            let per_worker = pins.pins_per_worker();
            let bytes_per_worker = pins.pinned_bytes_per_worker();
            prop_assert_eq!(per_worker.iter().sum::<usize>(), pins.total_pins());
            prop_assert_eq!(bytes_per_worker.iter().sum::<usize>(), pins.total_pinned_bytes());

            for (worker, size) in live.drain(..) {
                pins.decrement(WorkerId(worker), size);
            }
            pins.assert_zero();
        }
    }
}
