//! Per-instrument price level book.
//!
//! This implementation uses `BTreeMap` for sorted price levels, providing:
//!
//! - O(log n) insertion, deletion, and lookup
//! - O(1) access to best bid/ask (via `first_key_value` / `last_key_value`)
//! - Ordered iteration for depth-of-book queries

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tracing::trace;

use crate::error::Error;
use crate::types::{BookSide, Instrument, Price, Sequence, Size, Snapshot};

use super::view::BookView;

/// A detected hole in the delta sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// Sequence that should have come next
    pub expected: Sequence,
    /// Sequence that actually arrived
    pub got: Sequence,
}

/// Result of applying one delta to a book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A level was inserted, resized or removed
    Applied {
        /// Gap detected before this delta, if any
        gap: Option<SequenceGap>,
    },
    /// Zero-price sentinel: the sequence advanced, levels are untouched
    Sentinel {
        /// Gap detected before this delta, if any
        gap: Option<SequenceGap>,
    },
    /// Sequence at or below the last applied one; ignored entirely
    Duplicate,
}

impl ApplyOutcome {
    /// Gap detected while applying, if any
    #[must_use]
    pub fn gap(&self) -> Option<SequenceGap> {
        match self {
            ApplyOutcome::Applied { gap } | ApplyOutcome::Sentinel { gap } => *gap,
            ApplyOutcome::Duplicate => None,
        }
    }
}

/// Level-2 order book for a single instrument.
///
/// # Design Decisions
///
/// 1. **Exact decimals**: Prices and sizes are `rust_decimal::Decimal`, so a
///    zero size compares exactly equal to zero and textual variants of the
///    same price (`"100"`, `"100.0"`) land on the same level.
///
/// 2. **BTreeMap**: Sorted price levels with O(log n) operations.
///
/// 3. **Sequence tracking**: `last_sequence` only ever increases. A delta at
///    or below it is a duplicate. A delta that skips ahead is applied but its
///    sequence is recorded in `missing_sequences`.
///
/// # Thread Safety
///
/// This struct is `Send + Sync` but not internally synchronized. The registry
/// wraps each book in a `parking_lot::RwLock`.
#[derive(Debug, Clone)]
pub struct PriceLevelBook {
    /// Instrument this book belongs to
    instrument: Instrument,

    /// Bid levels: price -> size, best bid = highest = last
    bids: BTreeMap<Price, Size>,

    /// Ask levels: price -> size, best ask = lowest = first
    asks: BTreeMap<Price, Size>,

    /// Highest sequence applied so far
    last_sequence: Option<Sequence>,

    /// Sequences that arrived after a hole, in detection order
    missing_sequences: Vec<Sequence>,
}

impl PriceLevelBook {
    /// Create a new empty book for the given instrument
    #[must_use]
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_sequence: None,
            missing_sequences: Vec::new(),
        }
    }

    /// Get the instrument
    #[must_use]
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Highest sequence applied so far
    #[must_use]
    pub const fn last_sequence(&self) -> Option<Sequence> {
        self.last_sequence
    }

    /// Sequences recorded after detected gaps
    #[must_use]
    pub fn missing_sequences(&self) -> &[Sequence] {
        &self.missing_sequences
    }

    fn side(&self, side: BookSide) -> &BTreeMap<Price, Size> {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }

    fn side_mut(&mut self, side: BookSide) -> &mut BTreeMap<Price, Size> {
        match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        }
    }

    /// Apply an incremental change
    ///
    /// A zero price is a sentinel and leaves the levels untouched. A zero
    /// size removes the level. Anything else sets the level to `size`.
    pub fn apply(
        &mut self,
        side: BookSide,
        price: Price,
        size: Size,
        sequence: Sequence,
    ) -> ApplyOutcome {
        let mut gap = None;
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                return ApplyOutcome::Duplicate;
            }
            if sequence != last + 1 {
                self.missing_sequences.push(sequence);
                gap = Some(SequenceGap {
                    expected: last + 1,
                    got: sequence,
                });
            }
        }
        self.last_sequence = Some(sequence);

        if price.is_zero() {
            trace!(instrument = %self.instrument, sequence, "zero-price sentinel");
            return ApplyOutcome::Sentinel { gap };
        }

        self.set_level(side, price, size);
        ApplyOutcome::Applied { gap }
    }

    /// Set a price level directly, bypassing sequence tracking
    ///
    /// A zero size removes the level.
    pub fn set_level(&mut self, side: BookSide, price: Price, size: Size) {
        let levels = self.side_mut(side);
        if size.is_zero() {
            levels.remove(&price);
        } else {
            levels.insert(price, size);
        }
    }

    /// Replace the whole book with a snapshot
    ///
    /// The snapshot is the authoritative baseline: gap logic is bypassed and
    /// `last_sequence` becomes the snapshot sequence. Zero-size and
    /// zero-price levels in the snapshot are skipped.
    pub fn install_snapshot(&mut self, snapshot: &Snapshot) {
        self.bids.clear();
        self.asks.clear();

        for side in [BookSide::Bid, BookSide::Ask] {
            for &(price, size) in snapshot.levels(side) {
                if !price.is_zero() && !size.is_zero() {
                    self.side_mut(side).insert(price, size);
                }
            }
        }

        self.last_sequence = Some(snapshot.sequence);
    }

    /// Forget sequence history ahead of a recalibration
    ///
    /// Levels are kept until the next snapshot replaces them.
    pub fn reset_sequence_state(&mut self) {
        self.last_sequence = None;
        self.missing_sequences.clear();
    }

    /// Sorted projection of one side
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyBook`] if the side has no levels.
    pub fn view(&self, side: BookSide) -> Result<BookView, Error> {
        BookView::from_book(self, side)
    }

    /// Sorted projection of the side named by `token`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSide`] for an unknown token and
    /// [`Error::EmptyBook`] if the side has no levels.
    pub fn view_token(&self, token: &str) -> Result<BookView, Error> {
        self.view(token.parse()?)
    }

    /// Get the best bid (highest price)
    ///
    /// Returns `(price, size)` or `None` if no bids.
    #[must_use]
    pub fn best_bid(&self) -> Option<(Price, Size)> {
        self.bids.last_key_value().map(|(&p, &q)| (p, q))
    }

    /// Get the best ask (lowest price)
    ///
    /// Returns `(price, size)` or `None` if no asks.
    #[must_use]
    pub fn best_ask(&self) -> Option<(Price, Size)> {
        self.asks.first_key_value().map(|(&p, &q)| (p, q))
    }

    /// Get the mid price
    ///
    /// Returns the average of best bid and best ask, or `None` if either is missing.
    #[must_use]
    pub fn mid_price(&self) -> Option<Price> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Get the spread (best ask - best bid)
    #[must_use]
    pub fn spread(&self) -> Option<Price> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some(ask - bid),
            _ => None,
        }
    }

    /// Check if the book is crossed (best bid >= best ask)
    ///
    /// This shouldn't happen in a healthy book but is useful after a gap.
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => bid >= ask,
            _ => false,
        }
    }

    /// Get all bid levels, sorted by price descending (best first)
    pub fn bids(&self) -> impl Iterator<Item = (Price, Size)> + '_ {
        self.bids.iter().rev().map(|(&p, &q)| (p, q))
    }

    /// Get all ask levels, sorted by price ascending (best first)
    pub fn asks(&self) -> impl Iterator<Item = (Price, Size)> + '_ {
        self.asks.iter().map(|(&p, &q)| (p, q))
    }

    /// Levels of one side, best first
    pub fn levels(&self, side: BookSide) -> Box<dyn Iterator<Item = (Price, Size)> + '_> {
        match side {
            BookSide::Bid => Box::new(self.bids()),
            BookSide::Ask => Box::new(self.asks()),
        }
    }

    /// Size resting at a price, if any
    #[must_use]
    pub fn size_at(&self, side: BookSide, price: Price) -> Option<Size> {
        self.side(side).get(&price).copied()
    }

    /// Total size resting on one side
    #[must_use]
    pub fn total_size(&self, side: BookSide) -> Size {
        self.side(side).values().copied().sum()
    }

    /// Clear levels and sequence state
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.reset_sequence_state();
    }

    /// Check if the book is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Both sides carry at least one level
    #[must_use]
    pub fn is_populated(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    /// Get the number of price levels as `(bids, asks)`
    #[must_use]
    pub fn num_levels(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}
