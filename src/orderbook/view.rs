//! Read-only sorted projection of one side of a book.

use rust_decimal::Decimal;

use crate::error::Error;
use crate::types::{BookSide, Instrument, Price, Size};

use super::PriceLevelBook;

/// Sorted copy of one side of a [`PriceLevelBook`]
///
/// Bids are ordered by price descending, asks ascending, so `levels()[0]` is
/// always the best level. A view is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookView {
    instrument: Instrument,
    side: BookSide,
    levels: Vec<(Price, Size)>,
}

/// Result of walking a side to absorb a size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillEstimate {
    /// Number of levels touched, the last one possibly partially
    pub levels_consumed: usize,
    /// Price of the last level touched
    pub worst_price: Price,
    /// Sum of price * size over the consumed amount
    pub notional: Decimal,
}

impl FillEstimate {
    /// Size-weighted average price of the fill
    #[must_use]
    pub fn average_price(&self, size: Size) -> Option<Price> {
        if size.is_zero() {
            None
        } else {
            Some(self.notional / size)
        }
    }
}

impl BookView {
    /// Project one side of a book
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyBook`] if the side has no levels.
    pub fn from_book(book: &PriceLevelBook, side: BookSide) -> Result<Self, Error> {
        let levels: Vec<(Price, Size)> = book.levels(side).collect();
        if levels.is_empty() {
            return Err(Error::EmptyBook {
                instrument: book.instrument().clone(),
                side,
            });
        }
        Ok(Self {
            instrument: book.instrument().clone(),
            side,
            levels,
        })
    }

    /// Instrument of the projected book
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Projected side
    pub fn side(&self) -> BookSide {
        self.side
    }

    /// Levels, best first
    pub fn levels(&self) -> &[(Price, Size)] {
        &self.levels
    }

    /// Iterate levels, best first
    pub fn iter(&self) -> impl Iterator<Item = &(Price, Size)> {
        self.levels.iter()
    }

    /// Best level
    pub fn best(&self) -> (Price, Size) {
        self.levels[0]
    }

    /// Number of levels
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Whether the view holds no levels
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Total size across all levels
    pub fn total_size(&self) -> Size {
        self.levels.iter().map(|&(_, size)| size).sum()
    }

    /// Walk levels best-first until `size` is absorbed
    ///
    /// # Errors
    ///
    /// Returns [`Error::LiquidityInsufficient`] if the side holds less than
    /// `size` in total. Building the error has no other effect; deciding to
    /// stop trading the instrument is up to the caller.
    pub fn fill(&self, size: Size) -> Result<FillEstimate, Error> {
        let mut remaining = size;
        let mut notional = Decimal::ZERO;
        let mut levels_consumed = 0;
        let mut worst_price = self.levels[0].0;

        for &(price, level_size) in &self.levels {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = remaining.min(level_size);
            notional += take * price;
            remaining -= take;
            levels_consumed += 1;
            worst_price = price;
        }

        if remaining > Decimal::ZERO {
            return Err(Error::LiquidityInsufficient {
                instrument: self.instrument.clone(),
                side: self.side,
                requested: size,
                available: self.total_size(),
            });
        }

        Ok(FillEstimate {
            levels_consumed,
            worst_price,
            notional,
        })
    }
}

impl<'a> IntoIterator for &'a BookView {
    type Item = &'a (Price, Size);
    type IntoIter = std::slice::Iter<'a, (Price, Size)>;

    fn into_iter(self) -> Self::IntoIter {
        self.levels.iter()
    }
}
