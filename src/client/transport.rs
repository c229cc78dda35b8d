//! Transport seam between the engine and the venue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Error;
use crate::types::{Instrument, PairSummary, Snapshot};

use super::{RestClient, SubscriptionRequest};

/// How long a subscription may wait for the feed to confirm it
pub const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the engine needs from the venue
///
/// Implementations must not hold engine locks; the engine never calls into a
/// transport while holding one.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start streaming level2 deltas for the instruments
    ///
    /// Resolves once deltas for them are flowing.
    async fn subscribe_level2(&self, instruments: &[Instrument]) -> Result<(), Error>;

    /// Fetch one snapshot per instrument
    ///
    /// Instruments missing from the returned map had no snapshot available.
    async fn fetch_snapshots(
        &self,
        instruments: &[Instrument],
    ) -> Result<FxHashMap<Instrument, Snapshot>, Error>;

    /// Fetch the latest close, bid and ask of one instrument
    async fn fetch_pair_summary(&self, instrument: &Instrument) -> Result<PairSummary, Error>;

    /// Fetch taker fee rates
    ///
    /// Instruments missing from the returned map have no known fee.
    async fn fetch_fees(
        &self,
        instruments: &[Instrument],
    ) -> Result<FxHashMap<Instrument, Decimal>, Error>;
}

/// [`Transport`] backed by the venue's REST API and a [`super::FeedPump`]
///
/// Subscriptions are forwarded to the pump over a channel; the pump owns the
/// WebSocket and replays them after every reconnect. A subscription completes
/// when the pump reports the venue's ack, which only happens while connected.
#[derive(Debug, Clone)]
pub struct ExchangeTransport {
    rest: Arc<RestClient>,
    subscriptions: mpsc::UnboundedSender<SubscriptionRequest>,
    ack_timeout: Duration,
}

impl ExchangeTransport {
    /// Combine a REST client with the subscription channel of a pump
    pub fn new(
        rest: Arc<RestClient>,
        subscriptions: mpsc::UnboundedSender<SubscriptionRequest>,
    ) -> Self {
        Self {
            rest,
            subscriptions,
            ack_timeout: SUBSCRIBE_ACK_TIMEOUT,
        }
    }

    /// Set how long to wait for a subscription to be acknowledged
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Get the REST client
    pub fn rest(&self) -> &RestClient {
        &self.rest
    }
}

#[async_trait]
impl Transport for ExchangeTransport {
    async fn subscribe_level2(&self, instruments: &[Instrument]) -> Result<(), Error> {
        debug!(count = instruments.len(), "requesting level2 subscription");
        let (request, acked) = SubscriptionRequest::new(instruments.to_vec());
        self.subscriptions
            .send(request)
            .map_err(|_| Error::ConnectionClosed)?;

        match tokio::time::timeout(self.ack_timeout, acked).await {
            Ok(Ok(result)) => result,
            // Pump dropped the request
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn fetch_snapshots(
        &self,
        instruments: &[Instrument],
    ) -> Result<FxHashMap<Instrument, Snapshot>, Error> {
        let mut snapshots = FxHashMap::default();
        let mut last_error = None;
        for instrument in instruments {
            match self.rest.get_level2_snapshot(instrument).await {
                Ok(snapshot) => {
                    snapshots.insert(instrument.clone(), snapshot);
                }
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "snapshot request failed");
                    last_error = Some(e);
                }
            }
        }

        // Partial results are fine; only a total failure is an error
        match last_error {
            Some(e) if snapshots.is_empty() => Err(e),
            _ => Ok(snapshots),
        }
    }

    async fn fetch_pair_summary(&self, instrument: &Instrument) -> Result<PairSummary, Error> {
        Ok(self.rest.get_stats(instrument).await?.summary())
    }

    async fn fetch_fees(
        &self,
        instruments: &[Instrument],
    ) -> Result<FxHashMap<Instrument, Decimal>, Error> {
        self.rest.get_trade_fees(instruments).await
    }
}
