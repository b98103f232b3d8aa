//! Scan assembly and execution.
//!
//! [`plan`] assembles positioners, triggers, counters and detectors into a
//! [`StepScan`]; [`regions`] builds non-uniform point sequences for it;
//! [`engine`] drives the assembled plan through the run-loop state machine
//! while [`messenger`] reports per-point progress off the control path.

pub mod engine;
pub mod messenger;
pub mod plan;
pub mod regions;

pub use engine::{ScanProgress, StepScanEngine};
pub use messenger::{PointUpdate, ScanMessenger};
pub use plan::{CounterSet, PositionSet, SimpleDetector, StepScan, TriggerSet};
pub use regions::{Region, RegionBuilder};
