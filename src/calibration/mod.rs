//! Snapshot-plus-delta calibration.
//!
//! Deltas start arriving before the snapshot they must be applied on top of.
//! This module bridges the two:
//!
//! - [`CalibrationBuffer`] - holds an instrument's early deltas by sequence
//! - [`CalibrationCoordinator`] - per-instrument `Buffering | Live` state
//!   machine that installs snapshots, replays buffers and routes live deltas

pub mod buffer;
pub mod coordinator;

pub use buffer::{BufferedDelta, CalibrationBuffer, ReplayReport};
pub use coordinator::{CalibrationCoordinator, CalibrationState, DeltaRoute, Phase, SnapshotOutcome};
