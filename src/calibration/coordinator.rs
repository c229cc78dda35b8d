//! Bootstrap protocol: subscribe, buffer, snapshot, replay, go live.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::Transport;
use crate::config::{Config, ReconnectConfig};
use crate::error::Error;
use crate::events::{Delta, DeltaHandler, DisconnectHandler, SnapshotEvent, SnapshotHandler};
use crate::orderbook::ApplyOutcome;
use crate::registry::InstrumentRegistry;
use crate::types::{Instrument, Level2Update, Snapshot};

use super::buffer::{BufferedDelta, CalibrationBuffer, ReplayReport};

/// Calibration state of one instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    /// Deltas are held back until the snapshot is installed
    Buffering,
    /// Deltas are applied to the book as they arrive
    Live,
}

/// Calibration phase of the whole engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing subscribed
    Idle,
    /// At least one instrument is still buffering
    Calibrating,
    /// Every subscribed instrument is live
    Live,
}

/// Where a delta went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaRoute {
    /// Held in the calibration buffer
    Buffered,
    /// Applied to the live book
    Applied(ApplyOutcome),
    /// The instrument is not subscribed
    Untracked,
}

/// What happened to a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Installed and buffered deltas replayed; the instrument is live
    Installed(ReplayReport),
    /// Requested by a calibration attempt that has since been superseded
    Stale,
    /// The instrument is not subscribed
    Untracked,
    /// The instrument was already live
    AlreadyLive,
}

#[derive(Debug)]
struct Slot {
    state: CalibrationState,
    buffer: CalibrationBuffer,
}

struct Inner {
    registry: Arc<InstrumentRegistry>,
    transport: Arc<dyn Transport>,
    config: Config,
    slots: RwLock<FxHashMap<Instrument, Mutex<Slot>>>,
    attempt: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Drives every subscribed instrument from buffering to live.
///
/// # Protocol
///
/// 1. [`subscribe`](Self::subscribe) puts new instruments in
///    [`CalibrationState::Buffering`] and starts a calibration task.
/// 2. The task asks the transport to subscribe, waits the settle delay and
///    fetches snapshots. No lock is held meanwhile; deltas that arrive are
///    buffered by sequence. Failed or incomplete fetches are retried with
///    the reconnect backoff.
/// 3. [`install_snapshot`](Self::install_snapshot) replaces the book,
///    replays the buffer on top of it and marks the instrument live.
/// 4. A lost link puts everything back to buffering and starts over.
///
/// Each calibration run is tagged with an attempt number. Snapshots carry
/// the attempt that requested them and are dropped once it is superseded.
///
/// # Locking
///
/// Every mutation of an instrument holds its slot mutex and then its
/// registry record lock, always in that order.
#[derive(Clone)]
pub struct CalibrationCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CalibrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationCoordinator")
            .field("instruments", &self.inner.slots.read().len())
            .field("attempt", &self.attempt())
            .field("phase", &self.phase())
            .finish()
    }
}

impl CalibrationCoordinator {
    /// Create a coordinator with nothing subscribed
    pub fn new(
        registry: Arc<InstrumentRegistry>,
        transport: Arc<dyn Transport>,
        config: Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                transport,
                config,
                slots: RwLock::new(FxHashMap::default()),
                attempt: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start calibrating instruments
    ///
    /// Already subscribed instruments are left alone. When called inside a
    /// Tokio runtime a background task calibrates the new ones; otherwise
    /// drive [`calibrate`](Self::calibrate) yourself.
    ///
    /// Returns the newly subscribed instruments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstrumentNotFound`] if any instrument is not in the
    /// registry. Nothing is subscribed in that case.
    pub fn subscribe(&self, instruments: &[Instrument]) -> Result<Vec<Instrument>, Error> {
        if let Some(missing) = instruments
            .iter()
            .find(|instrument| !self.inner.registry.contains(instrument))
        {
            return Err(Error::InstrumentNotFound(missing.clone()));
        }

        let mut added = Vec::new();
        {
            let mut slots = self.inner.slots.write();
            for instrument in instruments {
                if !slots.contains_key(instrument) {
                    slots.insert(instrument.clone(), Mutex::new(self.new_slot()));
                    added.push(instrument.clone());
                }
            }
        }

        if !added.is_empty() {
            info!(count = added.len(), attempt = self.attempt(), "subscribed");
            self.spawn_calibration(added.clone());
        }
        Ok(added)
    }

    fn new_slot(&self) -> Slot {
        Slot {
            state: CalibrationState::Buffering,
            buffer: CalibrationBuffer::new(self.inner.config.max_buffered_deltas()),
        }
    }

    fn spawn_calibration(&self, instruments: Vec<Instrument>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no Tokio runtime, calibration must be driven manually");
            return;
        };

        let this = self.clone();
        let task = runtime.spawn(async move {
            match this.calibrate(instruments).await {
                Ok(installed) => debug!(installed, "calibration run finished"),
                Err(e) => warn!(error = %e, "calibration run failed, instruments stay buffering"),
            }
        });

        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Subscribe over the transport, fetch snapshots and install them
    ///
    /// Only instruments still buffering are fetched. Failures and
    /// instruments absent from the transport's answer are retried under the
    /// same attempt, backing off per [`Config::reconnect`] and honouring the
    /// venue's rate limit hint. Retrying stops once the attempt is
    /// superseded.
    ///
    /// Returns the number of snapshots installed. Instruments still missing
    /// a snapshot after the last retry stay buffering.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the last try failed.
    pub async fn calibrate(&self, instruments: Vec<Instrument>) -> Result<usize, Error> {
        let attempt = self.attempt();
        let policy = self.inner.config.reconnect();
        let mut pending = self.still_buffering(attempt, instruments);
        let mut subscribed = false;
        let mut installed = 0;
        let mut retry = 0;

        while !pending.is_empty() {
            let result = self.calibrate_once(attempt, &pending, &mut subscribed).await;
            if let Ok(count) = result {
                installed += count;
            }
            pending = self.still_buffering(attempt, pending);
            if pending.is_empty() {
                break;
            }

            if !policy.allows(retry) {
                return match result {
                    Err(e) => Err(e),
                    Ok(_) => {
                        warn!(attempt, missing = pending.len(), "giving up on snapshots");
                        Ok(installed)
                    }
                };
            }

            let delay = retry_delay(policy, retry, result.as_ref().err());
            debug!(
                attempt,
                retry,
                missing = pending.len(),
                delay_ms = delay.as_millis() as u64,
                "retrying calibration"
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
        Ok(installed)
    }

    /// Instruments of `attempt` that still need a snapshot
    fn still_buffering(&self, attempt: u64, mut instruments: Vec<Instrument>) -> Vec<Instrument> {
        if self.attempt() != attempt {
            return Vec::new();
        }
        instruments.retain(|instrument| self.state(instrument) == Some(CalibrationState::Buffering));
        instruments
    }

    async fn calibrate_once(
        &self,
        attempt: u64,
        instruments: &[Instrument],
        subscribed: &mut bool,
    ) -> Result<usize, Error> {
        if !*subscribed {
            self.inner.transport.subscribe_level2(instruments).await?;
            *subscribed = true;

            let settle = self.inner.config.snapshot_settle_delay();
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
        }

        debug!(count = instruments.len(), attempt, "requesting snapshots");
        let snapshots = self.inner.transport.fetch_snapshots(instruments).await?;

        let mut installed = 0;
        for (instrument, snapshot) in snapshots {
            if let SnapshotOutcome::Installed(_) = self.install_snapshot(attempt, &instrument, snapshot) {
                installed += 1;
            }
        }
        Ok(installed)
    }

    /// Route one delta to the buffer or the live book
    pub fn handle_delta(&self, delta: Delta) -> DeltaRoute {
        let slots = self.inner.slots.read();
        let Some(slot) = slots.get(&delta.instrument) else {
            return DeltaRoute::Untracked;
        };
        let mut slot = slot.lock();

        match slot.state {
            CalibrationState::Buffering => {
                slot.buffer.push(
                    &delta.instrument,
                    delta.sequence,
                    BufferedDelta {
                        side: delta.side,
                        price: delta.price,
                        size: delta.size,
                    },
                );
                DeltaRoute::Buffered
            }
            CalibrationState::Live => {
                let Some(record) = self.inner.registry.record(&delta.instrument) else {
                    return DeltaRoute::Untracked;
                };
                let outcome = record.write().book_mut().apply(
                    delta.side,
                    delta.price,
                    delta.size,
                    delta.sequence,
                );
                if let Some(gap) = outcome.gap() {
                    warn!(
                        instrument = %delta.instrument,
                        expected = gap.expected,
                        got = gap.got,
                        "sequence gap"
                    );
                }
                DeltaRoute::Applied(outcome)
            }
        }
    }

    /// Route every change of a level2 message, on both sides
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if any change is malformed; no
    /// change of the message is routed in that case.
    pub fn handle_level2(&self, update: &Level2Update) -> Result<Vec<DeltaRoute>, Error> {
        Ok(update
            .deltas()?
            .into_iter()
            .map(|delta| self.handle_delta(delta))
            .collect())
    }

    /// Install a snapshot and replay the buffered deltas on top of it
    pub fn install_snapshot(
        &self,
        attempt: u64,
        instrument: &Instrument,
        snapshot: Snapshot,
    ) -> SnapshotOutcome {
        let outcome = self.install_locked(attempt, instrument, &snapshot);

        match &outcome {
            SnapshotOutcome::Installed(report) => {
                debug!(
                    instrument = %instrument,
                    sequence = snapshot.sequence,
                    replayed = report.applied,
                    discarded = report.discarded,
                    "snapshot installed"
                );
                for gap in &report.gaps {
                    warn!(
                        instrument = %instrument,
                        expected = gap.expected,
                        got = gap.got,
                        "sequence gap during replay"
                    );
                }
                if self.is_calibrated() {
                    info!(attempt, "all instruments calibrated");
                }
            }
            SnapshotOutcome::Stale => {
                debug!(instrument = %instrument, attempt, current = self.attempt(), "stale snapshot dropped");
            }
            SnapshotOutcome::Untracked | SnapshotOutcome::AlreadyLive => {}
        }
        outcome
    }

    fn install_locked(
        &self,
        attempt: u64,
        instrument: &Instrument,
        snapshot: &Snapshot,
    ) -> SnapshotOutcome {
        let slots = self.inner.slots.read();
        let Some(slot) = slots.get(instrument) else {
            return SnapshotOutcome::Untracked;
        };
        let mut slot = slot.lock();

        // Checked under the slot lock so a concurrent reset cannot slip in
        // between the check and the install
        if attempt != self.attempt() {
            return SnapshotOutcome::Stale;
        }
        if slot.state == CalibrationState::Live {
            return SnapshotOutcome::AlreadyLive;
        }
        let Some(record) = self.inner.registry.record(instrument) else {
            return SnapshotOutcome::Untracked;
        };

        let mut record = record.write();
        let book = record.book_mut();
        book.install_snapshot(snapshot);
        let report = slot.buffer.replay_onto(book);
        slot.state = CalibrationState::Live;
        SnapshotOutcome::Installed(report)
    }

    /// Put every instrument back to buffering
    ///
    /// Aborts in-flight calibration, supersedes the current attempt, empties
    /// all buffers and forgets every book's sequence history. Book levels are
    /// kept until the next snapshot replaces them.
    pub fn reset(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.attempt.fetch_add(1, Ordering::SeqCst);

        let slots = self.inner.slots.read();
        for (instrument, slot) in slots.iter() {
            let mut slot = slot.lock();
            slot.state = CalibrationState::Buffering;
            slot.buffer.clear();
            if let Some(record) = self.inner.registry.record(instrument) {
                record.write().book_mut().reset_sequence_state();
            }
        }
    }

    /// React to a lost link: reset and recalibrate everything
    pub fn handle_disconnect(&self) {
        self.reset();
        let instruments = self.instruments();
        warn!(
            attempt = self.attempt(),
            instruments = instruments.len(),
            "link lost, recalibrating"
        );
        if !instruments.is_empty() {
            self.spawn_calibration(instruments);
        }
    }

    /// Drop an instrument's calibration slot
    ///
    /// Returns `true` if the instrument was subscribed.
    pub fn forget(&self, instrument: &Instrument) -> bool {
        self.inner.slots.write().remove(instrument).is_some()
    }

    /// Whether at least one instrument is subscribed and all are live
    pub fn is_calibrated(&self) -> bool {
        self.phase() == Phase::Live
    }

    /// Phase of the whole engine
    pub fn phase(&self) -> Phase {
        let slots = self.inner.slots.read();
        if slots.is_empty() {
            Phase::Idle
        } else if slots
            .values()
            .all(|slot| slot.lock().state == CalibrationState::Live)
        {
            Phase::Live
        } else {
            Phase::Calibrating
        }
    }

    /// Calibration state of one instrument, `None` if not subscribed
    pub fn state(&self, instrument: &Instrument) -> Option<CalibrationState> {
        self.inner
            .slots
            .read()
            .get(instrument)
            .map(|slot| slot.lock().state)
    }

    /// Number of deltas held for an instrument, `None` if not subscribed
    pub fn buffered_len(&self, instrument: &Instrument) -> Option<usize> {
        self.inner
            .slots
            .read()
            .get(instrument)
            .map(|slot| slot.lock().buffer.len())
    }

    /// Current calibration attempt
    pub fn attempt(&self) -> u64 {
        self.inner.attempt.load(Ordering::SeqCst)
    }

    /// Subscribed instruments, sorted
    pub fn instruments(&self) -> Vec<Instrument> {
        let mut instruments: Vec<Instrument> = self.inner.slots.read().keys().cloned().collect();
        instruments.sort();
        instruments
    }
}

impl SnapshotHandler for CalibrationCoordinator {
    fn on_snapshot(&self, event: SnapshotEvent) {
        self.install_snapshot(event.attempt, &event.instrument, event.snapshot);
    }
}

impl DeltaHandler for CalibrationCoordinator {
    fn on_delta(&self, delta: Delta) {
        self.handle_delta(delta);
    }
}

impl DisconnectHandler for CalibrationCoordinator {
    fn on_disconnect(&self) {
        self.handle_disconnect();
    }
}

/// Backoff before retry number `retry`, stretched to the venue's hint
fn retry_delay(policy: &ReconnectConfig, retry: u32, error: Option<&Error>) -> Duration {
    let backoff = policy.delay_for_attempt(retry);
    match error {
        Some(Error::RateLimited {
            retry_after_ms: Some(ms),
        }) => backoff.max(Duration::from_millis(*ms)),
        _ => backoff,
    }
}
