//! Scan plan assembly: grouped instrument sets and the `StepScan` aggregate.
//!
//! A `StepScan` is assembled with idempotent `add_*` calls before any run:
//! positioners, bare triggers/counters, composite detectors (whose trigger
//! and counters are pulled into the grouped sets), metadata channels,
//! breakpoints and the dwell schedule. Additions are deduplicated by
//! hardware address, so re-adding a component is harmless. Once a run
//! starts the plan is treated as immutable.

use crate::core::{Counter, CounterData, Detector, Dwelltime, MetaChannel, Positioner, Trigger};
use crate::error::{ScanError, ScanResult};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Grouped Sets
// =============================================================================

/// The plan's motion axes, operated as a group.
#[derive(Clone, Default)]
pub struct PositionSet {
    positioners: Vec<Arc<dyn Positioner>>,
}

impl PositionSet {
    /// Add an axis unless one with the same address is already present.
    pub fn add(&mut self, pos: Arc<dyn Positioner>) {
        if !self.positioners.iter().any(|p| p.address() == pos.address()) {
            self.positioners.push(pos);
        }
    }

    /// Axes in plan order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Positioner>> {
        self.positioners.iter()
    }

    /// Number of axes.
    pub fn len(&self) -> usize {
        self.positioners.len()
    }

    /// True when no axis was added.
    pub fn is_empty(&self) -> bool {
        self.positioners.is_empty()
    }

    /// Column labels in plan order.
    pub fn labels(&self) -> Vec<String> {
        self.positioners.iter().map(|p| p.label().to_string()).collect()
    }

    /// Scan length from the first axis's target array.
    pub fn npts(&self) -> usize {
        self.positioners
            .first()
            .map(|p| p.array().len())
            .unwrap_or(0)
    }

    /// Check array lengths and travel limits. Returns the point count.
    pub fn verify(&self) -> ScanResult<usize> {
        let mut npts: Option<usize> = None;
        if self.positioners.is_empty() {
            return Err(ScanError::Verification("scan has no positioners".into()));
        }
        for pos in &self.positioners {
            let array = pos.array();
            if array.is_empty() {
                return Err(ScanError::Verification(format!(
                    "positioner {} has an empty target array",
                    pos.address()
                )));
            }
            match npts {
                None => npts = Some(array.len()),
                Some(n) if n != array.len() => {
                    return Err(ScanError::Verification(
                        "inconsistent positioner array length".into(),
                    ));
                }
                Some(_) => {}
            }
            if let Some((low, high)) = pos.limits() {
                if array.iter().any(|v| *v < low || *v > high) {
                    return Err(ScanError::Verification(format!(
                        "positioner {} array out of bounds",
                        pos.address()
                    )));
                }
            }
        }
        Ok(npts.unwrap_or(0))
    }

    /// Issue `move_to_start` on every axis.
    pub async fn move_to_start(&self, wait: bool) -> Result<()> {
        for pos in &self.positioners {
            pos.move_to_start(wait).await?;
        }
        Ok(())
    }

    /// Issue a non-blocking move to target `i` on every axis.
    pub async fn move_to_pos(&self, i: usize) -> Result<()> {
        for pos in &self.positioners {
            pos.move_to_pos(i).await?;
        }
        Ok(())
    }

    /// Whether every axis reports its last move complete.
    pub async fn all_done(&self) -> Result<bool> {
        for pos in &self.positioners {
            if !pos.done().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Read-back values of every axis, in plan order.
    pub async fn current_all(&self) -> Result<Vec<f64>> {
        let mut values = Vec::with_capacity(self.positioners.len());
        for pos in &self.positioners {
            values.push(pos.current().await?);
        }
        Ok(values)
    }

    /// Issue non-blocking moves back to previously captured positions.
    pub async fn restore(&self, originals: &[f64]) -> Result<()> {
        for (pos, value) in self.positioners.iter().zip(originals) {
            pos.move_to(*value, false).await?;
        }
        Ok(())
    }
}

/// The plan's detector-start actuators, operated as a group.
#[derive(Clone, Default)]
pub struct TriggerSet {
    triggers: Vec<Arc<dyn Trigger>>,
}

impl TriggerSet {
    /// Add a trigger unless one with the same address is already present.
    pub fn add(&mut self, trigger: Arc<dyn Trigger>) {
        if !self.triggers.iter().any(|t| t.address() == trigger.address()) {
            self.triggers.push(trigger);
        }
    }

    /// Triggers in plan order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Trigger>> {
        self.triggers.iter()
    }

    /// Number of triggers.
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// True when no trigger was added.
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Start every trigger.
    pub async fn start_all(&self) -> Result<()> {
        for trig in &self.triggers {
            trig.start().await?;
        }
        Ok(())
    }

    /// Whether every trigger reports counting finished.
    pub async fn all_done(&self) -> Result<bool> {
        for trig in &self.triggers {
            if !trig.done().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether any trigger exposes an explicit stop.
    pub fn has_stop(&self) -> bool {
        self.triggers.iter().any(|t| t.has_stop())
    }

    /// Stop every trigger that supports it.
    pub async fn stop_all(&self) -> Result<()> {
        for trig in &self.triggers {
            if trig.has_stop() {
                trig.stop().await?;
            }
        }
        Ok(())
    }

    /// Wait until every stop has taken effect.
    pub async fn wait_for_stop_all(&self) -> Result<()> {
        for trig in &self.triggers {
            if trig.has_stop() {
                trig.wait_for_stop().await?;
            }
        }
        Ok(())
    }

    /// Shortest measured runtime across stoppable triggers, used to judge
    /// point validity.
    pub fn min_runtime(&self) -> Option<Duration> {
        self.triggers
            .iter()
            .filter(|t| t.has_stop())
            .map(|t| t.runtime())
            .min()
    }
}

/// The plan's readable channels, operated as a group.
#[derive(Clone, Default)]
pub struct CounterSet {
    counters: Vec<Arc<dyn Counter>>,
}

impl CounterSet {
    /// Add a counter unless one with the same address is already present.
    pub fn add(&mut self, counter: Arc<dyn Counter>) {
        if !self.counters.iter().any(|c| c.address() == counter.address()) {
            self.counters.push(counter);
        }
    }

    /// Counters in plan order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Counter>> {
        self.counters.iter()
    }

    /// Number of counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// True when no counter was added.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Column labels in plan order.
    pub fn labels(&self) -> Vec<String> {
        self.counters.iter().map(|c| c.label().to_string()).collect()
    }

    /// Waveform length bound from the first array counter, if any.
    pub fn nbins(&self) -> Option<usize> {
        self.counters.iter().find_map(|c| c.nbins_hint())
    }

    /// Read every counter once.
    pub async fn read_all(&self, nbins: Option<usize>) -> Result<()> {
        for counter in &self.counters {
            counter.read(nbins).await?;
        }
        Ok(())
    }

    /// Reset every counter's buffer.
    pub fn clear_all(&self) {
        for counter in &self.counters {
            counter.clear();
        }
    }

    /// Snapshot of every buffer, in plan order.
    pub fn data_snapshots(&self) -> Vec<CounterData> {
        self.counters.iter().map(|c| c.data()).collect()
    }
}

// =============================================================================
// SimpleDetector
// =============================================================================

/// Ready-made detector composite for the common case: one trigger with a
/// hardware preset count time and the counters it makes readable.
pub struct SimpleDetector {
    label: String,
    trigger: Arc<dyn Trigger>,
    counters: Vec<Arc<dyn Counter>>,
}

impl SimpleDetector {
    /// Detector wrapping `trigger` with no counters yet.
    pub fn new(label: &str, trigger: Arc<dyn Trigger>) -> Self {
        Self {
            label: label.to_string(),
            trigger,
            counters: Vec::new(),
        }
    }

    /// Add a counter read after each trigger completes.
    pub fn with_counter(mut self, counter: Arc<dyn Counter>) -> Self {
        self.counters.push(counter);
        self
    }
}

#[async_trait]
impl crate::core::ScanHooks for SimpleDetector {}

#[async_trait]
impl Detector for SimpleDetector {
    fn label(&self) -> &str {
        &self.label
    }

    fn trigger(&self) -> Arc<dyn Trigger> {
        self.trigger.clone()
    }

    fn counters(&self) -> Vec<Arc<dyn Counter>> {
        self.counters.clone()
    }

    async fn set_dwelltime(&self, seconds: f64) -> Result<()> {
        self.trigger.set_count_time(seconds).await
    }
}

// =============================================================================
// StepScan Plan
// =============================================================================

/// The immutable-once-built aggregate of everything one run coordinates.
pub struct StepScan {
    positioners: PositionSet,
    triggers: TriggerSet,
    counters: CounterSet,
    detectors: Vec<Arc<dyn Detector>>,
    meta_channels: Vec<Arc<dyn MetaChannel>>,
    breakpoints: BTreeSet<usize>,
    dwelltime: Dwelltime,
}

impl Default for StepScan {
    fn default() -> Self {
        Self::new()
    }
}

impl StepScan {
    /// Empty plan with a 1 s fixed dwell.
    pub fn new() -> Self {
        Self {
            positioners: PositionSet::default(),
            triggers: TriggerSet::default(),
            counters: CounterSet::default(),
            detectors: Vec::new(),
            meta_channels: Vec::new(),
            breakpoints: BTreeSet::new(),
            dwelltime: Dwelltime::Fixed(1.0),
        }
    }

    /// Add a motion axis, pulling in its metadata channels.
    pub fn add_positioner(&mut self, pos: Arc<dyn Positioner>) {
        for chan in pos.extra_channels() {
            self.add_meta_channel(chan);
        }
        self.positioners.add(pos);
    }

    /// Add a bare trigger not owned by any detector.
    pub fn add_trigger(&mut self, trigger: Arc<dyn Trigger>) {
        self.triggers.add(trigger);
    }

    /// Add a bare counter not owned by any detector.
    pub fn add_counter(&mut self, counter: Arc<dyn Counter>) {
        self.counters.add(counter);
    }

    /// Add a detector: its trigger, counters and metadata channels join the
    /// grouped sets, and its hooks run with the plan lifecycle.
    pub fn add_detector(&mut self, det: Arc<dyn Detector>) {
        self.triggers.add(det.trigger());
        for counter in det.counters() {
            self.counters.add(counter);
        }
        for chan in det.extra_channels() {
            self.add_meta_channel(chan);
        }
        if !self.detectors.iter().any(|d| d.label() == det.label()) {
            self.detectors.push(det);
        }
    }

    /// Add a metadata channel recorded at scan start and breakpoints.
    pub fn add_meta_channel(&mut self, chan: Arc<dyn MetaChannel>) {
        if !self.meta_channels.iter().any(|c| c.address() == chan.address()) {
            self.meta_channels.push(chan);
        }
    }

    /// Flush accumulated data when point `i` completes.
    pub fn add_breakpoint(&mut self, i: usize) {
        self.breakpoints.insert(i);
    }

    /// Set the dwell schedule, fixed or per-point.
    pub fn set_dwelltime(&mut self, dwelltime: Dwelltime) {
        self.dwelltime = dwelltime;
    }

    /// The motion axes.
    pub fn positioners(&self) -> &PositionSet {
        &self.positioners
    }

    /// The detector-start actuators.
    pub fn triggers(&self) -> &TriggerSet {
        &self.triggers
    }

    /// The readable channels.
    pub fn counters(&self) -> &CounterSet {
        &self.counters
    }

    /// The composite detectors.
    pub fn detectors(&self) -> &[Arc<dyn Detector>] {
        &self.detectors
    }

    /// The metadata channels.
    pub fn meta_channels(&self) -> &[Arc<dyn MetaChannel>] {
        &self.meta_channels
    }

    /// Configured breakpoint indices, ascending.
    pub fn breakpoints(&self) -> &BTreeSet<usize> {
        &self.breakpoints
    }

    /// The dwell schedule.
    pub fn dwelltime(&self) -> &Dwelltime {
        &self.dwelltime
    }

    /// Check positioner array lengths and travel limits. Returns the
    /// point count of the scan.
    pub fn verify(&self) -> ScanResult<usize> {
        self.positioners.verify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::{
        positioner_with_array, MockArrayCounter, MockCounter, MockPositioner, MockTrigger,
    };

    #[test]
    fn test_verify_accepts_equal_arrays() {
        let mut scan = StepScan::new();
        scan.add_positioner(positioner_with_array("m1", "x", vec![0.0, 1.0, 2.0]));
        scan.add_positioner(positioner_with_array("m2", "y", vec![5.0, 6.0, 7.0]));
        assert_eq!(scan.verify().unwrap(), 3);
    }

    #[test]
    fn test_verify_rejects_mismatched_arrays() {
        let mut scan = StepScan::new();
        scan.add_positioner(positioner_with_array("m1", "x", (0..10).map(f64::from).collect()));
        scan.add_positioner(positioner_with_array("m2", "y", (0..8).map(f64::from).collect()));
        assert!(matches!(scan.verify(), Err(ScanError::Verification(_))));
    }

    #[test]
    fn test_verify_rejects_out_of_limits() {
        let pos = Arc::new(
            MockPositioner::new("m1", "x").with_limits(0.0, 5.0),
        );
        pos.set_array(vec![0.0, 4.0, 6.0]);
        let mut scan = StepScan::new();
        scan.add_positioner(pos);
        let err = scan.verify().unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn test_add_detector_pulls_trigger_and_counters() {
        let trigger = Arc::new(MockTrigger::new("scaler"));
        let det = SimpleDetector::new("det", trigger)
            .with_counter(Arc::new(MockCounter::new("i0", "i0")))
            .with_counter(Arc::new(MockCounter::new("it", "it")));

        let mut scan = StepScan::new();
        scan.add_detector(Arc::new(det));
        assert_eq!(scan.triggers().len(), 1);
        assert_eq!(scan.counters().len(), 2);

        // re-adding by address is idempotent
        let trigger = Arc::new(MockTrigger::new("scaler"));
        let dup = SimpleDetector::new("det", trigger)
            .with_counter(Arc::new(MockCounter::new("i0", "i0")));
        scan.add_detector(Arc::new(dup));
        assert_eq!(scan.triggers().len(), 1);
        assert_eq!(scan.counters().len(), 2);
        assert_eq!(scan.detectors().len(), 1);
    }

    #[test]
    fn test_counter_set_nbins_from_array_counter() {
        let mut scan = StepScan::new();
        scan.add_counter(Arc::new(MockCounter::new("i0", "i0")));
        assert_eq!(scan.counters().nbins(), None);

        scan.add_counter(Arc::new(MockArrayCounter::new("mca", "mca", 2048)));
        assert_eq!(scan.counters().nbins(), Some(2048));
    }

    #[tokio::test]
    async fn test_position_set_group_motion() {
        let p1 = positioner_with_array("m1", "x", vec![0.0, 1.0]);
        let p2 = positioner_with_array("m2", "y", vec![0.0, 2.0]);
        let mut set = PositionSet::default();
        set.add(p1.clone());
        set.add(p2.clone());

        set.move_to_start(true).await.unwrap();
        assert!(set.all_done().await.unwrap());

        set.move_to_pos(1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let current = set.current_all().await.unwrap();
        assert!((current[0] - 1.0).abs() < 1e-9);
        assert!((current[1] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_breakpoints_are_sorted_and_unique() {
        let mut scan = StepScan::new();
        scan.add_breakpoint(7);
        scan.add_breakpoint(3);
        scan.add_breakpoint(7);
        let bps: Vec<usize> = scan.breakpoints().iter().copied().collect();
        assert_eq!(bps, vec![3, 7]);
    }
}
