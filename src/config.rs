//! Scan timing and retry configuration.
//!
//! `ScanSettings` collects the knobs the engine consults at run time: settle
//! delays, move/count timeouts, poll tick granularities, messenger staleness,
//! and the optional per-point retry cap. Values load from an optional TOML
//! file layered under `STEPSCAN_*` environment overrides, with defaults
//! matching the hardware-tolerant timeouts the engine was designed around.
//!
//! Durations are written in humantime notation (`"5ms"`, `"1h"`).

use crate::error::ScanResult;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Floor applied to settle delays and poll ticks. Hardware status flags are
/// not observable faster than this.
pub const MIN_POLL_TIME: Duration = Duration::from_millis(1);

/// Runtime knobs for the step-scan engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Delay after all positioners report done, before triggering.
    #[serde(with = "humantime_serde")]
    pub pos_settle_time: Duration,

    /// Delay after triggers finish, before counters are read.
    #[serde(with = "humantime_serde")]
    pub det_settle_time: Duration,

    /// Upper bound on waiting for positioner moves. A move still unfinished
    /// after this is treated as best-effort and the loop proceeds.
    #[serde(with = "humantime_serde")]
    pub pos_maxmove_time: Duration,

    /// Upper bound on waiting for triggers to report done.
    #[serde(with = "humantime_serde")]
    pub det_maxcount_time: Duration,

    /// Instrument status poll granularity inside a wait.
    #[serde(with = "humantime_serde")]
    pub instrument_tick: Duration,

    /// Outer tick at which waits re-check the interrupt source, and the
    /// pause busy-wait granularity.
    #[serde(with = "humantime_serde")]
    pub outer_tick: Duration,

    /// Messenger poll interval for the shared current-point cell.
    #[serde(with = "humantime_serde")]
    pub messenger_poll: Duration,

    /// Messenger exits if the current point has not changed for this long.
    #[serde(with = "humantime_serde")]
    pub messenger_timeout: Duration,

    /// Cap on re-executions of a point whose trigger under-ran. `None`
    /// preserves the unbounded baseline behavior.
    pub max_point_retries: Option<u32>,

    /// Progress is logged every this many points.
    pub message_points: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            pos_settle_time: MIN_POLL_TIME,
            det_settle_time: MIN_POLL_TIME,
            pos_maxmove_time: Duration::from_secs(3600),
            det_maxcount_time: Duration::from_secs(86400),
            instrument_tick: Duration::from_millis(5),
            outer_tick: Duration::from_millis(250),
            messenger_poll: Duration::from_millis(250),
            messenger_timeout: Duration::from_secs(3600),
            max_point_retries: None,
            message_points: 10,
        }
    }
}

impl ScanSettings {
    /// Load settings from an optional TOML file, then apply `STEPSCAN_*`
    /// environment overrides on top of the defaults.
    pub fn new(path: Option<&Path>) -> ScanResult<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&ScanSettings::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("STEPSCAN"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Settle delays never drop below the poll floor.
    pub fn effective_pos_settle(&self) -> Duration {
        self.pos_settle_time.max(MIN_POLL_TIME)
    }

    /// Settle delays never drop below the poll floor.
    pub fn effective_det_settle(&self) -> Duration {
        self.det_settle_time.max(MIN_POLL_TIME)
    }
}
