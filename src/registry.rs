//! Registry of tracked instruments.
//!
//! This module provides [`InstrumentRegistry`], a thread-safe container for
//! the tracked instruments, their static metadata, their latest pair summary
//! and each one's [`PriceLevelBook`].
//!
//! # Design
//!
//! The map is a `parking_lot::RwLock` around an `FxHashMap` whose values are
//! `Arc<RwLock<InstrumentRecord>>`. The map lock is held only to insert,
//! remove or look up a record; all book work happens under the record's own
//! lock, so readers of one instrument never wait on writers of another.
//!
//! # Ban list
//!
//! [`InstrumentRegistry::remove_instrument`] permanently excludes an
//! instrument: it is dropped from the map and [`InstrumentRegistry::ensure`]
//! refuses to add it again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::client::Transport;
use crate::config::Config;
use crate::error::Error;
use crate::events::{PairSummaryEvent, PairSummaryHandler};
use crate::orderbook::{BookView, PriceLevelBook};
use crate::types::{BookSide, Instrument, InstrumentMetadata, PairSummary, Sequence, SymbolInfo};

/// Everything known about one tracked instrument
#[derive(Debug, Clone)]
pub struct InstrumentRecord {
    /// Instrument identity
    pub instrument: Instrument,
    /// Latest close, bid and ask from a pair summary
    pub summary: PairSummary,
    /// Trading increments and fee rate
    pub metadata: InstrumentMetadata,
    /// When the summary was last refreshed
    pub last_updated: Instant,
    book: PriceLevelBook,
}

impl InstrumentRecord {
    fn new(instrument: Instrument, metadata: InstrumentMetadata) -> Self {
        Self {
            book: PriceLevelBook::new(instrument.clone()),
            instrument,
            summary: PairSummary::default(),
            metadata,
            last_updated: Instant::now(),
        }
    }

    /// The instrument's book
    pub fn book(&self) -> &PriceLevelBook {
        &self.book
    }

    pub(crate) fn book_mut(&mut self) -> &mut PriceLevelBook {
        &mut self.book
    }

    /// Taker fee rate, if known
    pub fn fee(&self) -> Option<Decimal> {
        self.metadata.fee
    }

    /// Whether the summary is older than `threshold`
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.last_updated.elapsed() >= threshold
    }

    fn apply_summary(&mut self, summary: PairSummary) {
        self.summary = summary;
        self.last_updated = Instant::now();
    }
}

/// Outcome of [`InstrumentRegistry::refresh_stale`]
#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Instruments whose summary was refreshed
    pub refreshed: Vec<Instrument>,
    /// Instruments whose refresh failed, with the reason
    pub failures: Vec<(Instrument, Error)>,
}

/// Outcome of [`InstrumentRegistry::backfill_missing_fees`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeeBackfillReport {
    /// Instruments that received a fee
    pub filled: Vec<Instrument>,
    /// Instruments the venue returned no fee for
    pub unresolved: Vec<Instrument>,
}

/// Registry of tracked instruments and their books.
///
/// # Thread Safety
///
/// The registry is safe to share across threads via `Arc<InstrumentRegistry>`.
/// No lock is held while the transport is awaited.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use l2book::registry::InstrumentRegistry;
/// use l2book::types::{Instrument, InstrumentMetadata};
/// use l2book::Config;
///
/// # fn example(transport: Arc<dyn l2book::client::Transport>) {
/// let registry = InstrumentRegistry::new(transport, &Config::new());
/// registry.ensure(Instrument::new("BTC", "USDT"), InstrumentMetadata::default());
/// assert_eq!(registry.len(), 1);
/// # }
/// ```
pub struct InstrumentRegistry {
    transport: Arc<dyn Transport>,
    fee_batch_size: usize,
    records: RwLock<FxHashMap<Instrument, Arc<RwLock<InstrumentRecord>>>>,
    banned: RwLock<FxHashSet<Instrument>>,
}

impl std::fmt::Debug for InstrumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentRegistry")
            .field("instruments", &self.records.read().len())
            .field("banned", &self.banned.read().len())
            .finish()
    }
}

impl InstrumentRegistry {
    /// Create an empty registry
    pub fn new(transport: Arc<dyn Transport>, config: &Config) -> Self {
        Self {
            transport,
            fee_batch_size: config.fee_batch_size(),
            records: RwLock::new(FxHashMap::default()),
            banned: RwLock::new(FxHashSet::default()),
        }
    }

    /// Track an instrument with a fresh empty book
    ///
    /// Returns `true` if the instrument was added. Already tracked and banned
    /// instruments are left alone.
    pub fn ensure(&self, instrument: Instrument, metadata: InstrumentMetadata) -> bool {
        if self.is_banned(&instrument) {
            debug!(instrument = %instrument, "refusing to track banned instrument");
            return false;
        }

        let mut records = self.records.write();
        if records.contains_key(&instrument) {
            return false;
        }
        records.insert(
            instrument.clone(),
            Arc::new(RwLock::new(InstrumentRecord::new(instrument, metadata))),
        );
        true
    }

    /// Track every listed symbol that is enabled for trading
    ///
    /// Returns the instruments that were added.
    pub fn ensure_from_symbols(&self, symbols: &[SymbolInfo]) -> Vec<Instrument> {
        let added: Vec<Instrument> = symbols
            .iter()
            .filter(|info| info.enable_trading)
            .filter_map(|info| {
                let instrument = info.instrument();
                self.ensure(instrument.clone(), info.metadata())
                    .then_some(instrument)
            })
            .collect();
        info!(listed = symbols.len(), added = added.len(), "instruments loaded");
        added
    }

    pub(crate) fn record(&self, instrument: &Instrument) -> Option<Arc<RwLock<InstrumentRecord>>> {
        self.records.read().get(instrument).cloned()
    }

    fn record_or_err(&self, instrument: &Instrument) -> Result<Arc<RwLock<InstrumentRecord>>, Error> {
        self.record(instrument)
            .ok_or_else(|| Error::InstrumentNotFound(instrument.clone()))
    }

    /// Instruments whose summary is older than `threshold`
    pub fn stale_instruments(&self, threshold: Duration) -> Vec<Instrument> {
        let records = self.records.read();
        let mut stale: Vec<Instrument> = records
            .iter()
            .filter(|(_, record)| record.read().is_stale(threshold))
            .map(|(instrument, _)| instrument.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Refresh the summary of every record older than `threshold`
    ///
    /// A failing instrument is reported and the others continue.
    pub async fn refresh_stale(&self, threshold: Duration) -> RefreshReport {
        let mut report = RefreshReport::default();

        for instrument in self.stale_instruments(threshold) {
            match self.transport.fetch_pair_summary(&instrument).await {
                Ok(summary) => {
                    if self.apply_pair_summary(&instrument, summary) {
                        report.refreshed.push(instrument);
                    }
                }
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "summary refresh failed");
                    report.failures.push((instrument, e));
                }
            }
        }

        debug!(
            refreshed = report.refreshed.len(),
            failed = report.failures.len(),
            "stale refresh done"
        );
        report
    }

    /// Query fees for every record without one
    ///
    /// Instruments the venue does not return a fee for stay unset.
    ///
    /// # Errors
    ///
    /// Returns the transport error of the first failing batch. Fees of
    /// earlier batches are kept.
    pub async fn backfill_missing_fees(&self) -> Result<FeeBackfillReport, Error> {
        let missing = self.missing_fee_instruments();
        let mut report = FeeBackfillReport::default();

        for chunk in missing.chunks(self.fee_batch_size) {
            let fees = self.transport.fetch_fees(chunk).await?;

            for instrument in chunk {
                let fee = fees.get(instrument).copied();
                let applied = match (fee, self.record(instrument)) {
                    (Some(fee), Some(record)) => {
                        record.write().metadata.fee = Some(fee);
                        true
                    }
                    _ => false,
                };
                if applied {
                    report.filled.push(instrument.clone());
                } else {
                    report.unresolved.push(instrument.clone());
                }
            }
        }

        if !report.unresolved.is_empty() {
            debug!(count = report.unresolved.len(), "fees still unknown");
        }
        Ok(report)
    }

    /// Permanently stop tracking an instrument
    ///
    /// Returns `true` if the instrument was not banned before.
    pub fn remove_instrument(&self, instrument: &Instrument) -> bool {
        self.records.write().remove(instrument);
        self.banned.write().insert(instrument.clone())
    }

    /// Update close, bid, ask and `last_updated` of a tracked instrument
    ///
    /// Returns `false` for untracked or banned instruments, which are ignored.
    pub fn apply_pair_summary(&self, instrument: &Instrument, summary: PairSummary) -> bool {
        match self.record(instrument) {
            Some(record) => {
                record.write().apply_summary(summary);
                true
            }
            None => false,
        }
    }

    /// Cloned record of an instrument
    pub fn get(&self, instrument: &Instrument) -> Result<InstrumentRecord, Error> {
        Ok(self.record_or_err(instrument)?.read().clone())
    }

    /// Sorted projection of one side of an instrument's book
    pub fn view(&self, instrument: &Instrument, side: BookSide) -> Result<BookView, Error> {
        self.with_book(instrument, |book| book.view(side))?
    }

    /// Sequences recorded after detected gaps
    pub fn missing_sequences(&self, instrument: &Instrument) -> Result<Vec<Sequence>, Error> {
        self.with_book(instrument, |book| book.missing_sequences().to_vec())
    }

    /// Run `f` on an instrument's book under its read lock
    pub fn with_book<R>(
        &self,
        instrument: &Instrument,
        f: impl FnOnce(&PriceLevelBook) -> R,
    ) -> Result<R, Error> {
        let record = self.record_or_err(instrument)?;
        let guard = record.read();
        Ok(f(&guard.book))
    }

    /// Run `f` on an instrument's book under its write lock
    pub fn with_book_mut<R>(
        &self,
        instrument: &Instrument,
        f: impl FnOnce(&mut PriceLevelBook) -> R,
    ) -> Result<R, Error> {
        let record = self.record_or_err(instrument)?;
        let mut guard = record.write();
        Ok(f(guard.book_mut()))
    }

    /// Tracked instruments, sorted
    pub fn instruments(&self) -> Vec<Instrument> {
        let mut instruments: Vec<Instrument> = self.records.read().keys().cloned().collect();
        instruments.sort();
        instruments
    }

    /// Banned instruments, sorted
    pub fn banned(&self) -> Vec<Instrument> {
        let mut banned: Vec<Instrument> = self.banned.read().iter().cloned().collect();
        banned.sort();
        banned
    }

    /// Whether an instrument is banned
    pub fn is_banned(&self, instrument: &Instrument) -> bool {
        self.banned.read().contains(instrument)
    }

    /// Whether an instrument is tracked
    pub fn contains(&self, instrument: &Instrument) -> bool {
        self.records.read().contains_key(instrument)
    }

    /// Tracked instruments without a fee, sorted
    pub fn missing_fee_instruments(&self) -> Vec<Instrument> {
        let records = self.records.read();
        let mut missing: Vec<Instrument> = records
            .iter()
            .filter(|(_, record)| record.read().metadata.fee.is_none())
            .map(|(instrument, _)| instrument.clone())
            .collect();
        missing.sort();
        missing
    }

    /// Number of tracked instruments
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no instrument is tracked
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl PairSummaryHandler for InstrumentRegistry {
    fn on_pair_summary(&self, event: PairSummaryEvent) {
        if !self.apply_pair_summary(&event.instrument, event.summary) {
            debug!(instrument = %event.instrument, "summary for untracked instrument ignored");
        }
    }
}
