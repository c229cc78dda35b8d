//! Per-instrument queue of deltas received before the snapshot.

use std::collections::BTreeMap;

use tracing::warn;

use crate::orderbook::{ApplyOutcome, PriceLevelBook, SequenceGap};
use crate::types::{BookSide, Instrument, Price, Sequence, Size};

/// A delta held back until the snapshot is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferedDelta {
    /// Side that changed
    pub side: BookSide,
    /// Price level
    pub price: Price,
    /// New size at the level
    pub size: Size,
}

/// Result of replaying a buffer on top of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries that moved the book forward (level changes and sentinels)
    pub applied: usize,
    /// Entries at or below the snapshot sequence
    pub discarded: usize,
    /// Holes found while replaying
    pub gaps: Vec<SequenceGap>,
}

/// Deltas keyed by sequence, replayed in ascending order
///
/// A second delta with the same sequence replaces the first. The buffer is
/// bounded: past `capacity` the lowest sequence is evicted.
#[derive(Debug, Clone)]
pub struct CalibrationBuffer {
    entries: BTreeMap<Sequence, BufferedDelta>,
    capacity: usize,
    evicted: usize,
}

impl CalibrationBuffer {
    /// Create an empty buffer holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    /// Hold a delta back
    ///
    /// Returns the evicted sequence when the buffer was full.
    pub fn push(
        &mut self,
        instrument: &Instrument,
        sequence: Sequence,
        delta: BufferedDelta,
    ) -> Option<Sequence> {
        self.entries.insert(sequence, delta);
        if self.entries.len() <= self.capacity {
            return None;
        }

        let (evicted, _) = self.entries.pop_first()?;
        self.evicted += 1;
        warn!(
            instrument = %instrument,
            sequence = evicted,
            capacity = self.capacity,
            "calibration buffer full, evicting oldest delta"
        );
        Some(evicted)
    }

    /// Apply every entry to `book` in ascending sequence order, then empty
    /// the buffer
    ///
    /// `book` must already hold the snapshot, so entries at or below its
    /// sequence come back as duplicates and are discarded.
    pub fn replay_onto(&mut self, book: &mut PriceLevelBook) -> ReplayReport {
        let mut report = ReplayReport::default();

        for (sequence, delta) in std::mem::take(&mut self.entries) {
            match book.apply(delta.side, delta.price, delta.size, sequence) {
                ApplyOutcome::Duplicate => report.discarded += 1,
                outcome => {
                    report.applied += 1;
                    report.gaps.extend(outcome.gap());
                }
            }
        }

        self.evicted = 0;
        report
    }

    /// Number of held deltas
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deltas evicted since the last replay or clear
    pub fn evicted(&self) -> usize {
        self.evicted
    }

    /// Lowest and highest held sequence
    pub fn sequence_range(&self) -> Option<(Sequence, Sequence)> {
        let first = self.entries.first_key_value()?.0;
        let last = self.entries.last_key_value()?.0;
        Some((*first, *last))
    }

    /// Drop every held delta
    pub fn clear(&mut self) {
        self.entries.clear();
        self.evicted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Snapshot;
    use rust_decimal::Decimal;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn inst() -> Instrument {
        Instrument::new("BTC", "USDT")
    }

    fn delta(side: BookSide, price: &str, size: &str) -> BufferedDelta {
        BufferedDelta {
            side,
            price: d(price),
            size: d(size),
        }
    }

    #[test]
    fn test_snapshot_then_replay() {
        let mut buffer = CalibrationBuffer::new(16);
        buffer.push(&inst(), 49, delta(BookSide::Bid, "100", "9"));
        buffer.push(&inst(), 51, delta(BookSide::Ask, "101", "2"));

        let mut book = PriceLevelBook::new(inst());
        book.install_snapshot(&Snapshot::new(50, vec![(d("100"), d("5"))], vec![]));
        let report = buffer.replay_onto(&mut book);

        assert_eq!(report.applied, 1);
        assert_eq!(report.discarded, 1);
        assert!(report.gaps.is_empty());
        assert_eq!(book.bids().collect::<Vec<_>>(), vec![(d("100"), d("5"))]);
        assert_eq!(book.asks().collect::<Vec<_>>(), vec![(d("101"), d("2"))]);
        assert_eq!(book.last_sequence(), Some(51));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_replay_is_ordered_by_sequence() {
        let mut buffer = CalibrationBuffer::new(16);
        buffer.push(&inst(), 13, delta(BookSide::Bid, "100", "0"));
        buffer.push(&inst(), 12, delta(BookSide::Bid, "100", "3"));
        buffer.push(&inst(), 11, delta(BookSide::Bid, "100", "1"));

        let mut book = PriceLevelBook::new(inst());
        book.install_snapshot(&Snapshot::new(10, vec![], vec![]));
        let report = buffer.replay_onto(&mut book);

        assert_eq!(report.applied, 3);
        // 11 then 12 then 13 (delete), so the level is gone
        assert!(book.is_empty());
    }

    #[test]
    fn test_last_write_wins_per_sequence() {
        let mut buffer = CalibrationBuffer::new(16);
        buffer.push(&inst(), 7, delta(BookSide::Ask, "50", "1"));
        buffer.push(&inst(), 7, delta(BookSide::Ask, "50", "4"));
        assert_eq!(buffer.len(), 1);

        let mut book = PriceLevelBook::new(inst());
        book.install_snapshot(&Snapshot::new(6, vec![], vec![]));
        buffer.replay_onto(&mut book);
        assert_eq!(book.size_at(BookSide::Ask, d("50")), Some(d("4")));
    }

    #[test]
    fn test_replay_reports_gap_after_snapshot() {
        let mut buffer = CalibrationBuffer::new(16);
        buffer.push(&inst(), 53, delta(BookSide::Bid, "99", "1"));

        let mut book = PriceLevelBook::new(inst());
        book.install_snapshot(&Snapshot::new(50, vec![], vec![]));
        let report = buffer.replay_onto(&mut book);

        assert_eq!(
            report.gaps,
            vec![SequenceGap {
                expected: 51,
                got: 53
            }]
        );
        assert_eq!(book.missing_sequences(), &[53]);
    }

    #[test]
    fn test_overflow_evicts_lowest_sequence() {
        let mut buffer = CalibrationBuffer::new(2);
        assert_eq!(buffer.push(&inst(), 5, delta(BookSide::Bid, "1", "1")), None);
        assert_eq!(buffer.push(&inst(), 6, delta(BookSide::Bid, "1", "1")), None);
        assert_eq!(buffer.push(&inst(), 7, delta(BookSide::Bid, "1", "1")), Some(5));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.evicted(), 1);
        assert_eq!(buffer.sequence_range(), Some((6, 7)));

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.evicted(), 0);
    }
}
