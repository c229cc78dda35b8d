//! # l2book
//!
//! Level-2 order book reconstruction from an exchange's snapshots and
//! sequence-numbered deltas.
//!
//! ## Features
//!
//! - **Calibration** - Deltas that arrive before the snapshot are buffered and
//!   replayed on top of it, per instrument
//! - **Gap Detection** - Skipped sequences are recorded, duplicates ignored
//! - **Recovery** - A lost link puts every book back into calibration
//! - **Exact Prices** - `rust_decimal` prices and sizes, `BTreeMap` levels
//! - **Async/Await** - Built on Tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use l2book::types::{BookSide, Instrument, InstrumentMetadata};
//! use l2book::{Config, Engine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), l2book::Error> {
//!     let engine = Engine::connect(Config::new())?;
//!
//!     let btc = Instrument::new("BTC", "USDT");
//!     engine.registry().ensure(btc.clone(), InstrumentMetadata::default());
//!     engine.subscribe(&[btc.clone()])?;
//!
//!     while !engine.is_calibrated() {
//!         tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//!     }
//!
//!     let asks = engine.view(&btc, BookSide::Ask)?;
//!     println!("best ask: {:?}", asks.best());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`types`] - Instruments, sides and venue wire types
//! - [`orderbook`] - Per-instrument price level book and sorted views
//! - [`calibration`] - Buffer and coordinator for the snapshot/delta bootstrap
//! - [`registry`] - Tracked instruments, metadata, staleness and ban list
//! - [`events`] - Typed feed events and the bus delivering them
//! - [`client`] - Transport trait, REST client and reconnecting WebSocket feed
//! - [`config`] - Configuration
//! - [`error`] - Error types for the crate

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod calibration;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod orderbook;
pub mod registry;
pub mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::calibration::CalibrationCoordinator;
use crate::client::{ExchangeTransport, FeedPump, RestClient, Transport};
use crate::events::{FeedBus, FeedEvent};
use crate::orderbook::{BookView, FillEstimate};
use crate::registry::{InstrumentRecord, InstrumentRegistry, RefreshReport};
use crate::types::{BookSide, Instrument, Sequence, Size};

// Re-export main types at crate root for convenience
pub use config::Config;
pub use error::Error;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Capacity of the channel between the feed and the bus
const EVENT_CHANNEL_CAPACITY: usize = 8192;

/// The order book engine
///
/// Owns the [`InstrumentRegistry`] and the [`CalibrationCoordinator`], and a
/// [`FeedBus`] wired to both. Cloning is cheap and clones share state.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use l2book::events::{Delta, FeedEvent, SnapshotEvent};
/// use l2book::types::{BookSide, Instrument, InstrumentMetadata, Snapshot};
/// use l2book::{Config, Engine};
///
/// # fn example(transport: Arc<dyn l2book::client::Transport>) -> l2book::Result<()> {
/// let engine = Engine::new(transport, Config::new());
/// let eth = Instrument::new("ETH", "USDT");
/// engine.registry().ensure(eth.clone(), InstrumentMetadata::default());
/// engine.subscribe(&[eth.clone()])?;
///
/// engine.publish(FeedEvent::Snapshot(SnapshotEvent {
///     instrument: eth.clone(),
///     attempt: engine.coordinator().attempt(),
///     snapshot: Snapshot::new(1, vec![("2000".parse().unwrap(), "1".parse().unwrap())], vec![]),
/// }));
/// assert!(engine.is_calibrated());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Engine {
    config: Config,
    registry: Arc<InstrumentRegistry>,
    coordinator: CalibrationCoordinator,
    bus: FeedBus,
}

impl Engine {
    /// Create an engine on top of a transport
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Self {
        let registry = Arc::new(InstrumentRegistry::new(transport.clone(), &config));
        let coordinator = CalibrationCoordinator::new(registry.clone(), transport, config.clone());
        let handler = Arc::new(coordinator.clone());

        let bus = FeedBus::new()
            .with_snapshot_handler(handler.clone())
            .with_delta_handler(handler.clone())
            .with_disconnect_handler(handler)
            .with_pair_summary_handler(registry.clone());

        Self {
            config,
            registry,
            coordinator,
            bus,
        }
    }

    /// Create an engine connected to the venue
    ///
    /// Spawns the [`FeedPump`] and the bus dispatcher. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the REST client cannot be initialized.
    pub fn connect(config: Config) -> Result<Self> {
        let rest = Arc::new(RestClient::new(&config)?);
        let (events_tx, events_rx) = mpsc::channel::<FeedEvent>(EVENT_CHANNEL_CAPACITY);
        let (pump, subscriptions) =
            FeedPump::new(rest.clone(), config.reconnect().clone(), events_tx);
        let transport = Arc::new(ExchangeTransport::new(rest, subscriptions));

        let engine = Self::new(transport, config);

        tokio::spawn(engine.bus().run(events_rx));
        tokio::spawn(async move {
            if let Err(e) = pump.run().await {
                error!(error = %e, "feed stopped");
            }
        });

        Ok(engine)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the instrument registry
    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    /// Get the calibration coordinator
    pub fn coordinator(&self) -> &CalibrationCoordinator {
        &self.coordinator
    }

    /// Get a handle to the bus, e.g. to run it on a channel
    pub fn bus(&self) -> FeedBus {
        self.bus.clone()
    }

    /// Deliver one event synchronously
    pub fn publish(&self, event: FeedEvent) {
        self.bus.publish(event);
    }

    /// Start calibrating tracked instruments
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstrumentNotFound`] if any instrument is not tracked.
    pub fn subscribe(&self, instruments: &[Instrument]) -> Result<Vec<Instrument>> {
        self.coordinator.subscribe(instruments)
    }

    /// Sorted projection of one side of an instrument's book
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstrumentNotFound`] or [`Error::EmptyBook`].
    pub fn view(&self, instrument: &Instrument, side: BookSide) -> Result<BookView> {
        self.registry.view(instrument, side)
    }

    /// Cloned record of an instrument
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstrumentNotFound`].
    pub fn instrument(&self, instrument: &Instrument) -> Result<InstrumentRecord> {
        self.registry.get(instrument)
    }

    /// Whether every subscribed instrument is live
    pub fn is_calibrated(&self) -> bool {
        self.coordinator.is_calibrated()
    }

    /// Sequences recorded after detected gaps
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstrumentNotFound`].
    pub fn missing_sequences(&self, instrument: &Instrument) -> Result<Vec<Sequence>> {
        self.registry.missing_sequences(instrument)
    }

    /// Walk one side of a book to absorb `size`
    ///
    /// # Errors
    ///
    /// Returns [`Error::LiquidityInsufficient`] when the side is too thin, as
    /// well as the errors of [`Engine::view`]. Nothing is banned
    /// automatically; see [`Engine::ban_instrument`].
    pub fn estimate_fill(
        &self,
        instrument: &Instrument,
        side: BookSide,
        size: Size,
    ) -> Result<FillEstimate> {
        self.view(instrument, side)?.fill(size)
    }

    /// Permanently stop tracking an instrument
    ///
    /// Removes it from the registry, drops its calibration slot and adds it
    /// to the ban list. Returns `true` if it was not banned before.
    pub fn ban_instrument(&self, instrument: &Instrument) -> bool {
        let newly_banned = self.registry.remove_instrument(instrument);
        self.coordinator.forget(instrument);
        if newly_banned {
            warn!(instrument = %instrument, "instrument banned");
        }
        newly_banned
    }

    /// Refresh summaries older than the configured stale threshold
    pub async fn refresh_stale(&self) -> RefreshReport {
        self.registry
            .refresh_stale(self.config.stale_threshold())
            .await
    }
}
