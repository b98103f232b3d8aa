//! Core traits and data types for the step-scan engine.
//!
//! This module defines the foundational abstractions the engine coordinates:
//! capability traits for motion axes, detector-start actuators and readable
//! channels, plus the shared data types the run loop passes between them.
//!
//! # Architecture Overview
//!
//! The engine is built on capability-based traits:
//!
//! - [`Positioner`]: one hardware motion axis with a precomputed target array
//! - [`Trigger`]: a detector-start actuator with polled completion
//! - [`Counter`]: a per-point readable channel with an accumulating buffer
//! - [`Detector`]: composite of exactly one trigger and a list of counters
//! - [`ScanHooks`]: pre-scan / post-scan / at-break lifecycle capability
//! - [`MetaChannel`]: a named channel recorded as metadata at scan start and
//!   at breakpoints
//!
//! # Thread Safety
//!
//! All traits require `Send + Sync` and take `&self`; implementations use
//! interior mutability so the plan can share trait objects (`Arc<dyn ...>`)
//! between its grouped sets and its detectors. Hardware completion is
//! observable only by polling the `done` flags — there is no callback or
//! event delivery anywhere in this interface.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// =============================================================================
// Basic Data Types
// =============================================================================

/// Accumulated readings of one counter across the points read so far.
///
/// Scalar counters grow one value per point; array counters grow one
/// fixed-size waveform per point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CounterData {
    /// One value per scan point.
    Scalar(Vec<f64>),
    /// One waveform per scan point.
    Waveform(Vec<Vec<f64>>),
}

impl CounterData {
    /// Number of points recorded so far.
    pub fn len(&self) -> usize {
        match self {
            CounterData::Scalar(v) => v.len(),
            CounterData::Waveform(v) => v.len(),
        }
    }

    /// True if nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scalar series view: scalar buffers as-is, waveforms reduced to their
    /// per-point sums (the column a file sink records for an array counter).
    pub fn as_scalar_series(&self) -> Vec<f64> {
        match self {
            CounterData::Scalar(v) => v.clone(),
            CounterData::Waveform(v) => v.iter().map(|w| w.iter().sum()).collect(),
        }
    }
}

/// Intended measurement duration at each point, fixed or per-point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Dwelltime {
    /// The same dwell at every point.
    Fixed(f64),
    /// One dwell value per point.
    PerPoint(Vec<f64>),
}

impl Dwelltime {
    /// Whether the dwell changes between points.
    pub fn varies(&self) -> bool {
        matches!(self, Dwelltime::PerPoint(_))
    }

    /// Dwell for point `i` (the fixed value, or the last entry if a
    /// per-point schedule is shorter than the scan).
    pub fn at(&self, i: usize) -> f64 {
        match self {
            Dwelltime::Fixed(t) => *t,
            Dwelltime::PerPoint(v) => v.get(i).or_else(|| v.last()).copied().unwrap_or(0.0),
        }
    }

    /// Smallest dwell in the schedule.
    pub fn min(&self) -> f64 {
        match self {
            Dwelltime::Fixed(t) => *t,
            Dwelltime::PerPoint(v) => v.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }

    /// Remaining counting time from point `i` to the end of an `npts` scan.
    pub fn remaining(&self, i: usize, npts: usize) -> f64 {
        match self {
            Dwelltime::Fixed(t) => t * npts.saturating_sub(i) as f64,
            Dwelltime::PerPoint(v) => v.iter().skip(i).take(npts.saturating_sub(i)).sum(),
        }
    }
}

/// Phase of the run-loop state machine, published to the status channel so
/// an external supervisor can observe the engine without inspecting it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanPhase {
    /// No run in progress.
    Idle,
    /// Checking array lengths and travel limits.
    Verifying,
    /// Running pre-scan hooks and connecting metadata channels.
    PreScan,
    /// Waiting for all positioners to reach their first targets.
    MovingToStart,
    /// Executing point iterations.
    Looping,
    /// Holding at the current point until resumed or aborted.
    Paused,
    /// Running at-break hooks and flushing data.
    Breakpoint,
    /// Returning positioners and closing the sink.
    PostScan,
    /// Run finished normally.
    Complete,
    /// Run unwound after an external abort.
    Aborted,
    /// Run ended with an error.
    Error,
}

impl ScanPhase {
    /// Stable lower-case name used in status strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPhase::Idle => "idle",
            ScanPhase::Verifying => "verifying",
            ScanPhase::PreScan => "pre_scan",
            ScanPhase::MovingToStart => "moving_to_start",
            ScanPhase::Looping => "looping",
            ScanPhase::Paused => "paused",
            ScanPhase::Breakpoint => "breakpoint",
            ScanPhase::PostScan => "post_scan",
            ScanPhase::Complete => "complete",
            ScanPhase::Aborted => "aborted",
            ScanPhase::Error => "error",
        }
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Lifecycle Hook Capability
// =============================================================================

/// Lifecycle capability carried by positioners and detectors.
///
/// The engine iterates hook carriers as a fixed, ordered interface —
/// positioners first, then detectors, in plan insertion order. All hooks of a
/// phase are run and their failures collected before the engine raises, so a
/// single report covers every failing participant.
#[async_trait]
pub trait ScanHooks: Send + Sync {
    /// Runs before any motion. Failure aborts the run with zero motion.
    async fn pre_scan(&self) -> Result<()> {
        Ok(())
    }

    /// Runs after the loop, during the post-scan phase.
    async fn post_scan(&self) -> Result<()> {
        Ok(())
    }

    /// Runs at each configured breakpoint, before the data flush.
    async fn at_break(&self, _breakpoint: usize) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Instrument Capability Traits
// =============================================================================

/// One hardware motion axis with a precomputed ordered target sequence.
///
/// All positioners in a plan must carry arrays of equal length — the number
/// of points in the scan. Moves are issued asynchronously; completion is
/// observed only by polling [`Positioner::done`].
#[async_trait]
pub trait Positioner: ScanHooks {
    /// Hardware address of the axis.
    fn address(&self) -> &str;

    /// Human-readable label used in data columns.
    fn label(&self) -> &str;

    /// Snapshot of the ordered target sequence.
    fn array(&self) -> Vec<f64>;

    /// Replace the target sequence.
    fn set_array(&self, targets: Vec<f64>);

    /// Travel limits `(low, high)` if the axis has them. Targets outside
    /// the limits fail plan verification.
    fn limits(&self) -> Option<(f64, f64)> {
        None
    }

    /// Issue a move. With `wait` the call returns only once the axis
    /// reports done; otherwise it returns immediately and the caller polls
    /// [`Positioner::done`].
    async fn move_to(&self, value: f64, wait: bool) -> Result<()>;

    /// Move to the first target of the array.
    async fn move_to_start(&self, wait: bool) -> Result<()> {
        let first = self
            .array()
            .first()
            .copied()
            .ok_or_else(|| anyhow!("positioner {} has an empty target array", self.address()))?;
        self.move_to(first, wait).await
    }

    /// Issue a non-blocking move to target `i`.
    async fn move_to_pos(&self, i: usize) -> Result<()> {
        let value = self.array().get(i).copied().ok_or_else(|| {
            anyhow!("positioner {} has no target at index {}", self.address(), i)
        })?;
        self.move_to(value, false).await
    }

    /// Current readback value.
    async fn current(&self) -> Result<f64>;

    /// Whether the last issued move has completed.
    async fn done(&self) -> Result<bool>;

    /// Metadata channels this axis contributes to the scan file.
    fn extra_channels(&self) -> Vec<std::sync::Arc<dyn MetaChannel>> {
        Vec::new()
    }
}

/// A detector-start actuator.
///
/// `start()` is asynchronous; the engine polls [`Trigger::done`] against the
/// counting timeout. Triggers that expose `stop()` are stopped once done and
/// their measured [`Trigger::runtime`] is used to validate the point.
#[async_trait]
pub trait Trigger: Send + Sync {
    /// Hardware address of the actuator.
    fn address(&self) -> &str;

    /// Start counting. Returns as soon as the start is accepted.
    async fn start(&self) -> Result<()>;

    /// Push a new preset counting time to the hardware. Actuators without
    /// a preset ignore this.
    async fn set_count_time(&self, _seconds: f64) -> Result<()> {
        Ok(())
    }

    /// Whether counting has finished.
    async fn done(&self) -> Result<bool>;

    /// Whether this trigger supports an explicit stop.
    fn has_stop(&self) -> bool {
        false
    }

    /// Stop counting. Only meaningful when [`Trigger::has_stop`] is true.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Wait until the stop has taken effect.
    async fn wait_for_stop(&self) -> Result<()> {
        Ok(())
    }

    /// Wall-clock counting time measured since the last `start()`.
    fn runtime(&self) -> Duration;
}

/// A per-point readable measurement channel with an accumulating buffer.
#[async_trait]
pub trait Counter: Send + Sync {
    /// Hardware address of the channel.
    fn address(&self) -> &str;

    /// Human-readable label used in data columns.
    fn label(&self) -> &str;

    /// Read the channel once and append to the buffer. `nbins` bounds the
    /// waveform length for array counters and is ignored by scalar ones.
    async fn read(&self, nbins: Option<usize>) -> Result<()>;

    /// Discard the buffer. Called once at run start.
    fn clear(&self);

    /// Number of points recorded so far.
    fn len(&self) -> usize;

    /// True if nothing has been recorded yet.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the accumulated buffer.
    fn data(&self) -> CounterData;

    /// For array counters, the configured upper bound on waveform length.
    /// The engine derives the per-point `nbins` from the first counter that
    /// reports one.
    fn nbins_hint(&self) -> Option<usize> {
        None
    }
}

/// Composite of exactly one trigger and the counters it makes readable.
///
/// A detector is owned exclusively by the plan that added it; its trigger
/// and counters are pulled into the plan's grouped sets at `add_detector`
/// time. Dwell changes fan out to detectors through
/// [`Detector::set_dwelltime`].
#[async_trait]
pub trait Detector: ScanHooks {
    /// Identifying label for logs and error messages.
    fn label(&self) -> &str;

    /// The detector-start trigger.
    fn trigger(&self) -> std::sync::Arc<dyn Trigger>;

    /// The channels read after each trigger completes.
    fn counters(&self) -> Vec<std::sync::Arc<dyn Counter>>;

    /// Push a new counting time to the hardware.
    async fn set_dwelltime(&self, seconds: f64) -> Result<()>;

    /// Metadata channels this detector contributes to the scan file.
    fn extra_channels(&self) -> Vec<std::sync::Arc<dyn MetaChannel>> {
        Vec::new()
    }
}

/// A named channel recorded as file metadata at scan start and breakpoints.
#[async_trait]
pub trait MetaChannel: Send + Sync {
    /// Human-readable description written next to the value.
    fn description(&self) -> &str;

    /// Hardware address of the channel.
    fn address(&self) -> &str;

    /// Establish the connection. Called once during the pre-scan phase.
    async fn connect(&self) -> Result<()>;

    /// Read the current value as display text.
    async fn read_text(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_data_scalar_series() {
        let scalar = CounterData::Scalar(vec![1.0, 2.0]);
        assert_eq!(scalar.as_scalar_series(), vec![1.0, 2.0]);

        let wave = CounterData::Waveform(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(wave.len(), 2);
        assert_eq!(wave.as_scalar_series(), vec![3.0, 7.0]);
    }

    #[test]
    fn test_dwelltime_schedule() {
        let fixed = Dwelltime::Fixed(0.5);
        assert!(!fixed.varies());
        assert_eq!(fixed.at(7), 0.5);
        assert_eq!(fixed.remaining(2, 4), 1.0);

        let per_point = Dwelltime::PerPoint(vec![1.0, 0.5, 0.25]);
        assert!(per_point.varies());
        assert_eq!(per_point.at(1), 0.5);
        assert_eq!(per_point.min(), 0.25);
        assert_eq!(per_point.remaining(1, 3), 0.75);
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(ScanPhase::MovingToStart.as_str(), "moving_to_start");
        assert_eq!(ScanPhase::Complete.to_string(), "complete");
    }
}
