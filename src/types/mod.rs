//! Core domain types and venue wire types.
//!
//! - [`market`] - Instrument identity, static metadata and pair summaries
//! - [`side`] - Book side (bid or ask)
//! - [`messages`] - WebSocket and REST payloads received from the venue

pub mod market;
pub mod messages;
pub mod side;

pub use market::{Instrument, InstrumentMetadata, PairSummary, SymbolInfo};
pub use messages::{Level2Update, Snapshot, WsMessage};
pub use side::BookSide;

use rust_decimal::Decimal;

/// Price of a level, as an exact decimal
///
/// Binary floating point is never used for prices: level deletion relies on
/// exact comparison with zero, and two textual prices that denote the same
/// value must hit the same map key.
pub type Price = Decimal;

/// Size resting at a price level, as an exact decimal
pub type Size = Decimal;

/// Feed sequence number
pub type Sequence = u64;

/// Timestamp in milliseconds since Unix epoch
pub type TimestampMs = u64;
