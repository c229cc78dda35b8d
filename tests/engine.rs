//! End-to-end tests of the engine over an in-memory transport.
//!
//! The transport can hold subscriptions or snapshot requests until the test
//! releases them, which lets deltas be published while a calibration is in
//! flight. It can also rate limit its first snapshot requests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tokio_test::{assert_err, assert_ok};

use l2book::calibration::{CalibrationState, Phase};
use l2book::client::Transport;
use l2book::events::{Delta, FeedEvent, PairSummaryEvent, SnapshotEvent};
use l2book::types::{BookSide, Instrument, InstrumentMetadata, PairSummary, Snapshot};
use l2book::config::ReconnectConfig;
use l2book::{Config, Engine, Error};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn btc() -> Instrument {
    Instrument::new("BTC", "USDT")
}

fn eth() -> Instrument {
    Instrument::new("ETH", "USDT")
}

/// In-memory venue
#[derive(Default)]
struct MockTransport {
    snapshots: Mutex<FxHashMap<Instrument, Snapshot>>,
    summaries: Mutex<FxHashMap<Instrument, PairSummary>>,
    subscribed: Mutex<Vec<Instrument>>,
    snapshot_requests: AtomicUsize,
    gated: bool,
    gate: Notify,
    subscribe_gated: bool,
    subscribe_gate: Notify,
    subscribe_calls: AtomicUsize,
    throttled: usize,
}

impl MockTransport {
    fn gated() -> Self {
        Self {
            gated: true,
            ..Self::default()
        }
    }

    fn gated_subscribe() -> Self {
        Self {
            subscribe_gated: true,
            ..Self::default()
        }
    }

    /// Rate limit the first `requests` snapshot requests
    fn throttled(requests: usize) -> Self {
        Self {
            throttled: requests,
            ..Self::default()
        }
    }

    fn with_snapshot(self, instrument: Instrument, snapshot: Snapshot) -> Self {
        self.snapshots.lock().insert(instrument, snapshot);
        self
    }

    fn release(&self) {
        self.gate.notify_one();
    }

    fn acknowledge_subscribe(&self) {
        self.subscribe_gate.notify_one();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe_level2(&self, instruments: &[Instrument]) -> Result<(), Error> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.subscribe_gated {
            self.subscribe_gate.notified().await;
        }
        self.subscribed.lock().extend_from_slice(instruments);
        Ok(())
    }

    async fn fetch_snapshots(
        &self,
        instruments: &[Instrument],
    ) -> Result<FxHashMap<Instrument, Snapshot>, Error> {
        let request = self.snapshot_requests.fetch_add(1, Ordering::SeqCst);
        if request < self.throttled {
            return Err(Error::RateLimited {
                retry_after_ms: Some(10),
            });
        }
        if self.gated {
            self.gate.notified().await;
        }
        let snapshots = self.snapshots.lock();
        Ok(instruments
            .iter()
            .filter_map(|i| snapshots.get(i).map(|s| (i.clone(), s.clone())))
            .collect())
    }

    async fn fetch_pair_summary(&self, instrument: &Instrument) -> Result<PairSummary, Error> {
        self.summaries
            .lock()
            .get(instrument)
            .copied()
            .ok_or(Error::Timeout)
    }

    async fn fetch_fees(
        &self,
        _instruments: &[Instrument],
    ) -> Result<FxHashMap<Instrument, Decimal>, Error> {
        Ok(FxHashMap::default())
    }
}

fn engine_with(transport: Arc<MockTransport>, instruments: &[Instrument]) -> Engine {
    let config = Config::new()
        .with_snapshot_settle_delay(Duration::ZERO)
        .with_reconnect(ReconnectConfig::new().initial_delay_ms(5).max_delay_ms(50));
    let engine = Engine::new(transport, config);
    for instrument in instruments {
        engine
            .registry()
            .ensure(instrument.clone(), InstrumentMetadata::default());
    }
    engine
}

fn delta(instrument: Instrument, side: BookSide, price: &str, size: &str, sequence: u64) -> FeedEvent {
    FeedEvent::Delta(Delta {
        instrument,
        side,
        price: d(price),
        size: d(size),
        sequence,
    })
}

/// Poll until `cond` holds, yielding to spawned tasks in between
async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_deltas_during_calibration_are_replayed() {
    init_tracing();
    let transport = Arc::new(
        MockTransport::gated()
            .with_snapshot(btc(), Snapshot::new(50, vec![(d("100"), d("5"))], vec![])),
    );
    let engine = engine_with(transport.clone(), &[btc()]);

    assert_ok!(engine.subscribe(&[btc()]));
    wait_until(|| transport.snapshot_requests.load(Ordering::SeqCst) == 1).await;
    assert_eq!(transport.subscribed.lock().as_slice(), &[btc()]);

    // Snapshot request is in flight; these must be buffered
    engine.publish(delta(btc(), BookSide::Bid, "100", "9", 49));
    engine.publish(delta(btc(), BookSide::Ask, "101", "2", 51));
    assert_eq!(engine.coordinator().buffered_len(&btc()), Some(2));
    assert!(!engine.is_calibrated());

    transport.release();
    wait_until(|| engine.is_calibrated()).await;

    let bids = assert_ok!(engine.view(&btc(), BookSide::Bid));
    let asks = assert_ok!(engine.view(&btc(), BookSide::Ask));
    assert_eq!(bids.levels(), &[(d("100"), d("5"))]);
    assert_eq!(asks.levels(), &[(d("101"), d("2"))]);
    assert!(assert_ok!(engine.missing_sequences(&btc())).is_empty());
}

#[tokio::test]
async fn test_disconnect_triggers_recalibration() {
    init_tracing();
    let transport = Arc::new(
        MockTransport::default()
            .with_snapshot(btc(), Snapshot::new(10, vec![(d("100"), d("1"))], vec![(d("101"), d("1"))])),
    );
    let engine = engine_with(transport.clone(), &[btc()]);

    engine.subscribe(&[btc()]).unwrap();
    wait_until(|| engine.is_calibrated()).await;
    let first_attempt = engine.coordinator().attempt();

    engine.publish(FeedEvent::LinkDisconnected);
    assert!(!engine.is_calibrated());
    assert_eq!(engine.coordinator().attempt(), first_attempt + 1);

    wait_until(|| engine.is_calibrated()).await;
    assert_eq!(transport.snapshot_requests.load(Ordering::SeqCst), 2);
    assert_eq!(transport.subscribed.lock().len(), 2);
}

#[tokio::test]
async fn test_superseded_snapshot_is_discarded() {
    init_tracing();
    let transport = Arc::new(
        MockTransport::gated().with_snapshot(btc(), Snapshot::new(10, vec![], vec![])),
    );
    let engine = engine_with(transport.clone(), &[btc()]);

    engine.subscribe(&[btc()]).unwrap();
    let old_attempt = engine.coordinator().attempt();
    wait_until(|| transport.snapshot_requests.load(Ordering::SeqCst) == 1).await;

    engine.publish(FeedEvent::LinkDisconnected);

    // A late answer for the old attempt arrives through the bus
    engine.publish(FeedEvent::Snapshot(SnapshotEvent {
        instrument: btc(),
        attempt: old_attempt,
        snapshot: Snapshot::new(3, vec![(d("1"), d("1"))], vec![]),
    }));
    assert_eq!(
        engine.coordinator().state(&btc()),
        Some(CalibrationState::Buffering)
    );
    assert!(engine.view(&btc(), BookSide::Bid).is_err());

    // The new attempt completes normally
    wait_until(|| transport.snapshot_requests.load(Ordering::SeqCst) == 2).await;
    transport.release();
    wait_until(|| engine.is_calibrated()).await;
}

#[tokio::test]
async fn test_missing_snapshot_is_fetched_again() {
    init_tracing();
    let transport = Arc::new(
        MockTransport::default().with_snapshot(btc(), Snapshot::new(1, vec![], vec![(d("5"), d("1"))])),
    );
    let engine = engine_with(transport.clone(), &[btc(), eth()]);

    engine.subscribe(&[btc(), eth()]).unwrap();
    wait_until(|| engine.coordinator().state(&btc()) == Some(CalibrationState::Live)).await;

    assert_eq!(engine.coordinator().phase(), Phase::Calibrating);
    assert_eq!(
        engine.coordinator().state(&eth()),
        Some(CalibrationState::Buffering)
    );
    assert!(!engine.is_calibrated());
    let attempt = engine.coordinator().attempt();

    // The venue starts answering for ETH; a retry of the same attempt picks it up
    transport
        .snapshots
        .lock()
        .insert(eth(), Snapshot::new(7, vec![(d("2"), d("3"))], vec![]));
    wait_until(|| engine.is_calibrated()).await;

    assert_eq!(engine.coordinator().attempt(), attempt);
    assert!(transport.snapshot_requests.load(Ordering::SeqCst) >= 2);
    let bids = assert_ok!(engine.view(&eth(), BookSide::Bid));
    assert_eq!(bids.levels(), &[(d("2"), d("3"))]);
    // Only the first run subscribes
    assert_eq!(transport.subscribed.lock().as_slice(), &[btc(), eth()]);
}

#[tokio::test]
async fn test_snapshot_waits_for_subscription() {
    init_tracing();
    let transport = Arc::new(
        MockTransport::gated_subscribe()
            .with_snapshot(btc(), Snapshot::new(50, vec![(d("100"), d("5"))], vec![])),
    );
    let engine = engine_with(transport.clone(), &[btc()]);

    engine.subscribe(&[btc()]).unwrap();
    wait_until(|| transport.subscribe_calls.load(Ordering::SeqCst) == 1).await;

    // Subscription not confirmed yet: no snapshot may be requested
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.snapshot_requests.load(Ordering::SeqCst), 0);
    engine.publish(delta(btc(), BookSide::Ask, "101", "2", 51));
    assert_eq!(engine.coordinator().buffered_len(&btc()), Some(1));

    transport.acknowledge_subscribe();
    wait_until(|| engine.is_calibrated()).await;

    assert_eq!(transport.snapshot_requests.load(Ordering::SeqCst), 1);
    let asks = assert_ok!(engine.view(&btc(), BookSide::Ask));
    assert_eq!(asks.levels(), &[(d("101"), d("2"))]);
    assert!(assert_ok!(engine.missing_sequences(&btc())).is_empty());
}

#[tokio::test]
async fn test_rate_limited_snapshot_is_retried() {
    init_tracing();
    let transport = Arc::new(
        MockTransport::throttled(1)
            .with_snapshot(btc(), Snapshot::new(10, vec![(d("100"), d("1"))], vec![])),
    );
    let engine = engine_with(transport.clone(), &[btc()]);
    engine.subscribe(&[btc()]).unwrap();
    let attempt = engine.coordinator().attempt();
    wait_until(|| engine.is_calibrated()).await;

    assert_eq!(transport.snapshot_requests.load(Ordering::SeqCst), 2);
    assert_eq!(engine.coordinator().attempt(), attempt);
    assert_eq!(transport.subscribed.lock().len(), 1);
}

#[tokio::test]
async fn test_bus_channel_preserves_order() {
    init_tracing();
    let transport = Arc::new(MockTransport::default());
    let engine = engine_with(transport, &[btc()]);
    engine.subscribe(&[btc()]).unwrap();
    engine.publish(FeedEvent::Snapshot(SnapshotEvent {
        instrument: btc(),
        attempt: engine.coordinator().attempt(),
        snapshot: Snapshot::new(100, vec![], vec![]),
    }));
    assert!(engine.is_calibrated());

    let (tx, rx) = mpsc::channel(16);
    let dispatcher = tokio::spawn(engine.bus().run(rx));
    tx.send(delta(btc(), BookSide::Bid, "10", "1", 101)).await.unwrap();
    tx.send(delta(btc(), BookSide::Bid, "10", "3", 102)).await.unwrap();
    tx.send(delta(btc(), BookSide::Bid, "10", "0", 103)).await.unwrap();
    tx.send(delta(btc(), BookSide::Bid, "11", "2", 104)).await.unwrap();
    drop(tx);
    dispatcher.await.unwrap();

    let bids = engine.view(&btc(), BookSide::Bid).unwrap();
    assert_eq!(bids.levels(), &[(d("11"), d("2"))]);
}

#[tokio::test]
async fn test_insufficient_liquidity_then_ban() {
    init_tracing();
    let transport = Arc::new(MockTransport::default());
    let engine = engine_with(transport, &[btc()]);
    engine.subscribe(&[btc()]).unwrap();
    engine.publish(FeedEvent::Snapshot(SnapshotEvent {
        instrument: btc(),
        attempt: engine.coordinator().attempt(),
        snapshot: Snapshot::new(1, vec![], vec![(d("100"), d("0.5")), (d("101"), d("0.25"))]),
    }));

    let estimate = assert_ok!(engine.estimate_fill(&btc(), BookSide::Ask, d("0.6")));
    assert_eq!(estimate.levels_consumed, 2);
    assert_eq!(estimate.worst_price, d("101"));

    let err = assert_err!(engine.estimate_fill(&btc(), BookSide::Ask, d("1")));
    assert!(matches!(err, Error::LiquidityInsufficient { .. }));
    // The error alone changes nothing
    assert!(engine.registry().contains(&btc()));

    assert!(engine.ban_instrument(&btc()));
    assert!(!engine.registry().contains(&btc()));
    assert!(engine.registry().is_banned(&btc()));
    assert_eq!(engine.coordinator().state(&btc()), None);
    assert!(!engine
        .registry()
        .ensure(btc(), InstrumentMetadata::default()));
    assert!(matches!(
        engine.instrument(&btc()),
        Err(Error::InstrumentNotFound(_))
    ));
}

#[tokio::test]
async fn test_pair_summaries_and_stale_refresh() {
    init_tracing();
    let transport = Arc::new(MockTransport::default());
    transport.summaries.lock().insert(
        eth(),
        PairSummary {
            close: Some(d("2000")),
            bid: Some(d("1999")),
            ask: Some(d("2001")),
        },
    );
    let engine = engine_with(transport, &[btc(), eth()]);

    engine.publish(FeedEvent::PairSummary(PairSummaryEvent {
        instrument: btc(),
        summary: PairSummary {
            close: Some(d("50000")),
            bid: None,
            ask: None,
        },
    }));
    assert_eq!(
        engine.instrument(&btc()).unwrap().summary.close,
        Some(d("50000"))
    );

    let report = engine.registry().refresh_stale(Duration::ZERO).await;
    assert_eq!(report.refreshed, vec![eth()]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(
        engine.instrument(&eth()).unwrap().summary.ask,
        Some(d("2001"))
    );
}
