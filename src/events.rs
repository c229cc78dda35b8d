//! Typed feed events and the bus that delivers them.
//!
//! Every inbound event kind has its own handler trait. Consumers register
//! with a [`FeedBus`] at construction time, and the bus routes each event to
//! the handlers of its kind. Tests can drive the engine by publishing events
//! directly, without a live connection.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use l2book::events::{FeedBus, FeedEvent};
//!
//! # async fn example(engine: l2book::Engine) {
//! let (tx, rx) = tokio::sync::mpsc::channel::<FeedEvent>(4096);
//! let bus = engine.bus();
//! tokio::spawn(async move { bus.run(rx).await });
//! // hand `tx` to the transport
//! # drop(tx);
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Error;
use crate::types::{BookSide, Instrument, Level2Update, PairSummary, Price, Sequence, Size, Snapshot};

/// One book change on one side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// Instrument the change belongs to
    pub instrument: Instrument,
    /// Side that changed
    pub side: BookSide,
    /// Price level
    pub price: Price,
    /// New size at the level (zero removes it)
    pub size: Size,
    /// Feed sequence of the change
    pub sequence: Sequence,
}

/// Snapshot result tagged with the calibration attempt that requested it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEvent {
    /// Instrument the snapshot belongs to
    pub instrument: Instrument,
    /// Calibration attempt that requested the snapshot
    pub attempt: u64,
    /// Snapshot payload
    pub snapshot: Snapshot,
}

/// Pair summary pushed by the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSummaryEvent {
    /// Instrument the summary belongs to
    pub instrument: Instrument,
    /// Close, bid and ask
    pub summary: PairSummary,
}

/// Inbound event
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Snapshot fetched for a calibration attempt
    Snapshot(SnapshotEvent),
    /// Single book change
    Delta(Delta),
    /// Whole level2 message, expanded into deltas on delivery
    Level2(Level2Update),
    /// The feed connection dropped
    LinkDisconnected,
    /// Summary of a pair outside the book
    PairSummary(PairSummaryEvent),
}

impl FeedEvent {
    /// Short name of the event kind, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::Snapshot(_) => "snapshot",
            FeedEvent::Delta(_) => "delta",
            FeedEvent::Level2(_) => "level2",
            FeedEvent::LinkDisconnected => "link_disconnected",
            FeedEvent::PairSummary(_) => "pair_summary",
        }
    }
}

/// Receives snapshots
pub trait SnapshotHandler: Send + Sync {
    /// Handle one snapshot
    fn on_snapshot(&self, event: SnapshotEvent);
}

/// Receives book changes
pub trait DeltaHandler: Send + Sync {
    /// Handle one change
    fn on_delta(&self, delta: Delta);

    /// Handle a whole level2 message
    ///
    /// The default expands the message and forwards every change, on every
    /// side, to [`DeltaHandler::on_delta`]. A malformed message is rejected
    /// as a whole before any change is forwarded.
    fn on_level2(&self, update: Level2Update) -> Result<(), Error> {
        for delta in update.deltas()? {
            self.on_delta(delta);
        }
        Ok(())
    }
}

/// Receives link loss notifications
pub trait DisconnectHandler: Send + Sync {
    /// Handle a dropped link
    fn on_disconnect(&self);
}

/// Receives pair summaries
pub trait PairSummaryHandler: Send + Sync {
    /// Handle one summary
    fn on_pair_summary(&self, event: PairSummaryEvent);
}

/// Typed publish/subscribe dispatcher
///
/// Handlers are invoked synchronously in registration order. Events are
/// delivered in the order they are published, which is what keeps
/// per-instrument sequence order intact.
#[derive(Default, Clone)]
pub struct FeedBus {
    snapshot: Vec<Arc<dyn SnapshotHandler>>,
    delta: Vec<Arc<dyn DeltaHandler>>,
    disconnect: Vec<Arc<dyn DisconnectHandler>>,
    pair_summary: Vec<Arc<dyn PairSummaryHandler>>,
}

impl fmt::Debug for FeedBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedBus")
            .field("snapshot_handlers", &self.snapshot.len())
            .field("delta_handlers", &self.delta.len())
            .field("disconnect_handlers", &self.disconnect.len())
            .field("pair_summary_handlers", &self.pair_summary.len())
            .finish()
    }
}

impl FeedBus {
    /// Create a bus with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a snapshot handler
    #[must_use]
    pub fn with_snapshot_handler(mut self, handler: Arc<dyn SnapshotHandler>) -> Self {
        self.snapshot.push(handler);
        self
    }

    /// Register a delta handler
    #[must_use]
    pub fn with_delta_handler(mut self, handler: Arc<dyn DeltaHandler>) -> Self {
        self.delta.push(handler);
        self
    }

    /// Register a disconnect handler
    #[must_use]
    pub fn with_disconnect_handler(mut self, handler: Arc<dyn DisconnectHandler>) -> Self {
        self.disconnect.push(handler);
        self
    }

    /// Register a pair summary handler
    #[must_use]
    pub fn with_pair_summary_handler(mut self, handler: Arc<dyn PairSummaryHandler>) -> Self {
        self.pair_summary.push(handler);
        self
    }

    /// Deliver one event to the handlers of its kind
    ///
    /// Malformed level2 messages are logged and dropped.
    pub fn publish(&self, event: FeedEvent) {
        match event {
            FeedEvent::Snapshot(ev) => {
                for handler in &self.snapshot {
                    handler.on_snapshot(ev.clone());
                }
            }
            FeedEvent::Delta(delta) => {
                for handler in &self.delta {
                    handler.on_delta(delta.clone());
                }
            }
            FeedEvent::Level2(update) => {
                for handler in &self.delta {
                    if let Err(e) = handler.on_level2(update.clone()) {
                        warn!(symbol = %update.symbol, error = %e, "dropping level2 message");
                        break;
                    }
                }
            }
            FeedEvent::LinkDisconnected => {
                for handler in &self.disconnect {
                    handler.on_disconnect();
                }
            }
            FeedEvent::PairSummary(ev) => {
                for handler in &self.pair_summary {
                    handler.on_pair_summary(ev.clone());
                }
            }
        }
    }

    /// Drain a channel until every sender is dropped
    pub async fn run(self, mut events: mpsc::Receiver<FeedEvent>) {
        while let Some(event) = events.recv().await {
            self.publish(event);
        }
        debug!("feed channel closed, dispatcher exiting");
    }
}
