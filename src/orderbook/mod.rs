//! Level-2 order book data structures.
//!
//! This module provides:
//!
//! - [`PriceLevelBook`] - per-instrument price levels with sequence tracking
//!   and gap detection
//! - [`BookView`] - sorted read-only projection of one side
//!
//! # Example
//!
//! ```rust
//! use l2book::orderbook::PriceLevelBook;
//! use l2book::types::{BookSide, Instrument};
//!
//! let mut book = PriceLevelBook::new(Instrument::new("BTC", "USDT"));
//!
//! book.apply(BookSide::Bid, "100.5".parse().unwrap(), "2".parse().unwrap(), 1);
//! book.apply(BookSide::Bid, "100.4".parse().unwrap(), "1".parse().unwrap(), 2);
//!
//! let bids = book.view(BookSide::Bid).unwrap();
//! assert_eq!(bids.best().0.to_string(), "100.5");
//! ```

pub mod book;
pub mod view;

pub use book::{ApplyOutcome, PriceLevelBook, SequenceGap};
pub use view::{BookView, FillEstimate};
