//! Mock instrument implementations.
//!
//! Provides simulated positioners, triggers and counters for testing the
//! scan engine without physical hardware. All mocks are async-safe (motion
//! and counting are modeled as deadlines against a monotonic clock, never
//! blocking sleeps) and use interior mutability so they can be shared as
//! trait objects.
//!
//! # Available Mocks
//!
//! - `MockPositioner` - simulated axis with configurable speed and limits
//! - `MockTrigger` - simulated detector start with preset count time and
//!   optional under-run injection
//! - `MockCounter` / `MockArrayCounter` - simulated readable channels
//! - `MockDetector` is covered by [`crate::scan::SimpleDetector`] over the
//!   mocks above
//! - `MockMetaChannel` - simulated metadata channel

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::core::{Counter, CounterData, MetaChannel, Positioner, ScanHooks, Trigger};

// =============================================================================
// MockPositioner - Simulated Motion Axis
// =============================================================================

struct Motion {
    from: f64,
    target: f64,
    started: Instant,
    duration: Duration,
}

/// Mock motion axis with configurable speed.
///
/// Moves take `|target - current| / speed` seconds of wall-clock time;
/// `done()` flips once the deadline passes and `current()` interpolates
/// linearly until then. Issued moves are counted so tests can assert that
/// a rejected plan performed zero motion.
pub struct MockPositioner {
    address: String,
    label: String,
    array: RwLock<Vec<f64>>,
    limits: Option<(f64, f64)>,
    speed: f64,
    motion: RwLock<Motion>,
    moves_issued: AtomicUsize,
    fail_pre_scan: AtomicBool,
    at_break_calls: AtomicUsize,
}

impl MockPositioner {
    /// Create a mock axis at position 0.0 with a 1000 units/sec drive.
    pub fn new(address: &str, label: &str) -> Self {
        Self {
            address: address.to_string(),
            label: label.to_string(),
            array: RwLock::new(Vec::new()),
            limits: None,
            speed: 1000.0,
            motion: RwLock::new(Motion {
                from: 0.0,
                target: 0.0,
                started: Instant::now(),
                duration: Duration::ZERO,
            }),
            moves_issued: AtomicUsize::new(0),
            fail_pre_scan: AtomicBool::new(false),
            at_break_calls: AtomicUsize::new(0),
        }
    }

    /// Set the drive speed in units/sec.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Set travel limits checked during plan verification.
    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low, high));
        self
    }

    /// Make `pre_scan()` fail, for hook-failure tests.
    pub fn with_failing_pre_scan(self) -> Self {
        self.fail_pre_scan.store(true, Ordering::SeqCst);
        self
    }

    /// Number of moves issued so far.
    pub fn moves_issued(&self) -> usize {
        self.moves_issued.load(Ordering::SeqCst)
    }

    /// Number of times the at-break hook ran.
    pub fn at_break_calls(&self) -> usize {
        self.at_break_calls.load(Ordering::SeqCst)
    }

    fn position_now(&self) -> f64 {
        let motion = self.motion.read();
        if motion.duration.is_zero() {
            return motion.target;
        }
        let frac = motion.started.elapsed().as_secs_f64() / motion.duration.as_secs_f64();
        if frac >= 1.0 {
            motion.target
        } else {
            motion.from + frac * (motion.target - motion.from)
        }
    }
}

#[async_trait]
impl ScanHooks for MockPositioner {
    async fn pre_scan(&self) -> Result<()> {
        if self.fail_pre_scan.load(Ordering::SeqCst) {
            return Err(anyhow!("MockPositioner {}: pre_scan failed", self.address));
        }
        Ok(())
    }

    async fn at_break(&self, _breakpoint: usize) -> Result<()> {
        self.at_break_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Positioner for MockPositioner {
    fn address(&self) -> &str {
        &self.address
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn array(&self) -> Vec<f64> {
        self.array.read().clone()
    }

    fn set_array(&self, targets: Vec<f64>) {
        *self.array.write() = targets;
    }

    fn limits(&self) -> Option<(f64, f64)> {
        self.limits
    }

    async fn move_to(&self, value: f64, wait: bool) -> Result<()> {
        let from = self.position_now();
        let duration = Duration::from_secs_f64((value - from).abs() / self.speed);
        {
            let mut motion = self.motion.write();
            motion.from = from;
            motion.target = value;
            motion.started = Instant::now();
            motion.duration = duration;
        }
        self.moves_issued.fetch_add(1, Ordering::SeqCst);
        if wait {
            sleep(duration).await;
        }
        Ok(())
    }

    async fn current(&self) -> Result<f64> {
        Ok(self.position_now())
    }

    async fn done(&self) -> Result<bool> {
        let motion = self.motion.read();
        Ok(motion.started.elapsed() >= motion.duration)
    }
}

// =============================================================================
// MockTrigger - Simulated Detector Start
// =============================================================================

/// Mock detector-start actuator with a preset count time.
///
/// Counting completes after the preset elapses. The first
/// `underrun_starts` starts complete after a tenth of the preset instead,
/// reporting a correspondingly short runtime, which makes the engine mark
/// the point invalid and retry it.
pub struct MockTrigger {
    address: String,
    count_time: RwLock<Duration>,
    started: RwLock<Option<Instant>>,
    effective: RwLock<Duration>,
    has_stop: bool,
    starts: AtomicUsize,
    underrun_starts: AtomicU32,
}

impl MockTrigger {
    /// Create a mock trigger with a 10 ms preset.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            count_time: RwLock::new(Duration::from_millis(10)),
            started: RwLock::new(None),
            effective: RwLock::new(Duration::from_millis(10)),
            has_stop: false,
            starts: AtomicUsize::new(0),
            underrun_starts: AtomicU32::new(0),
        }
    }

    /// Expose a `stop()` capability, enabling point validity checks.
    pub fn with_stop(mut self) -> Self {
        self.has_stop = true;
        self
    }

    /// Make the first `n` starts under-run their preset.
    pub fn with_underruns(self, n: u32) -> Self {
        self.underrun_starts.store(n, Ordering::SeqCst);
        self
    }

    /// Number of starts issued so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Currently configured preset count time.
    pub fn count_time(&self) -> Duration {
        *self.count_time.read()
    }
}

#[async_trait]
impl Trigger for MockTrigger {
    fn address(&self) -> &str {
        &self.address
    }

    async fn start(&self) -> Result<()> {
        let preset = *self.count_time.read();
        let remaining_underruns = self.underrun_starts.load(Ordering::SeqCst);
        let effective = if remaining_underruns > 0 {
            self.underrun_starts
                .store(remaining_underruns - 1, Ordering::SeqCst);
            preset / 10
        } else {
            preset
        };
        *self.effective.write() = effective;
        *self.started.write() = Some(Instant::now());
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_count_time(&self, seconds: f64) -> Result<()> {
        *self.count_time.write() = Duration::from_secs_f64(seconds.max(0.0));
        Ok(())
    }

    async fn done(&self) -> Result<bool> {
        let started = self.started.read();
        match *started {
            Some(t0) => Ok(t0.elapsed() >= *self.effective.read()),
            None => Ok(true),
        }
    }

    fn has_stop(&self) -> bool {
        self.has_stop
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn runtime(&self) -> Duration {
        match *self.started.read() {
            Some(t0) => t0.elapsed().min(*self.effective.read()),
            None => Duration::ZERO,
        }
    }
}

// =============================================================================
// MockCounter / MockArrayCounter - Simulated Channels
// =============================================================================

/// Mock scalar channel producing noisy readings around a baseline.
pub struct MockCounter {
    address: String,
    label: String,
    baseline: f64,
    buff: RwLock<Vec<f64>>,
}

impl MockCounter {
    /// Create a mock counter with a baseline of 1000 counts.
    pub fn new(address: &str, label: &str) -> Self {
        Self {
            address: address.to_string(),
            label: label.to_string(),
            baseline: 1000.0,
            buff: RwLock::new(Vec::new()),
        }
    }

    /// Set the reading baseline.
    pub fn with_baseline(mut self, baseline: f64) -> Self {
        self.baseline = baseline;
        self
    }
}

#[async_trait]
impl Counter for MockCounter {
    fn address(&self) -> &str {
        &self.address
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn read(&self, _nbins: Option<usize>) -> Result<()> {
        let value = self.baseline * rand::thread_rng().gen_range(0.95..1.05);
        self.buff.write().push(value);
        Ok(())
    }

    fn clear(&self) {
        self.buff.write().clear();
    }

    fn len(&self) -> usize {
        self.buff.read().len()
    }

    fn data(&self) -> CounterData {
        CounterData::Scalar(self.buff.read().clone())
    }
}

/// Mock array channel reading a fixed-size waveform per point.
pub struct MockArrayCounter {
    address: String,
    label: String,
    nbins: usize,
    buff: RwLock<Vec<Vec<f64>>>,
}

impl MockArrayCounter {
    /// Create a mock array counter with `nbins` bins per waveform.
    pub fn new(address: &str, label: &str, nbins: usize) -> Self {
        Self {
            address: address.to_string(),
            label: label.to_string(),
            nbins,
            buff: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Counter for MockArrayCounter {
    fn address(&self) -> &str {
        &self.address
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn read(&self, nbins: Option<usize>) -> Result<()> {
        let n = nbins.unwrap_or(self.nbins).min(self.nbins);
        let mut rng = rand::thread_rng();
        let wave: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..100.0)).collect();
        self.buff.write().push(wave);
        Ok(())
    }

    fn clear(&self) {
        self.buff.write().clear();
    }

    fn len(&self) -> usize {
        self.buff.read().len()
    }

    fn data(&self) -> CounterData {
        CounterData::Waveform(self.buff.read().clone())
    }

    fn nbins_hint(&self) -> Option<usize> {
        Some(self.nbins)
    }
}

// =============================================================================
// MockMetaChannel - Simulated Metadata Channel
// =============================================================================

/// Mock metadata channel with a settable text value.
pub struct MockMetaChannel {
    description: String,
    address: String,
    value: RwLock<String>,
    connected: AtomicBool,
}

impl MockMetaChannel {
    /// Create a mock metadata channel.
    pub fn new(description: &str, address: &str, value: &str) -> Self {
        Self {
            description: description.to_string(),
            address: address.to_string(),
            value: RwLock::new(value.to_string()),
            connected: AtomicBool::new(false),
        }
    }

    /// Update the value the channel reports.
    pub fn set_value(&self, value: &str) {
        *self.value.write() = value.to_string();
    }

    /// Whether `connect()` has been called.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetaChannel for MockMetaChannel {
    fn description(&self) -> &str {
        &self.description
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read_text(&self) -> Result<String> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(anyhow!("MockMetaChannel {}: not connected", self.address));
        }
        Ok(self.value.read().clone())
    }
}

/// Convenience: an `Arc`-wrapped mock positioner pre-loaded with targets.
pub fn positioner_with_array(address: &str, label: &str, targets: Vec<f64>) -> Arc<MockPositioner> {
    let pos = Arc::new(MockPositioner::new(address, label));
    pos.set_array(targets);
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_positioner_move_and_done() {
        let pos = MockPositioner::new("mock:m1", "x").with_speed(10_000.0);

        pos.move_to(5.0, true).await.unwrap();
        assert!(pos.done().await.unwrap());
        assert!((pos.current().await.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(pos.moves_issued(), 1);
    }

    #[tokio::test]
    async fn test_mock_positioner_nonblocking_move() {
        let pos = MockPositioner::new("mock:m1", "x").with_speed(50.0);

        pos.move_to(1.0, false).await.unwrap();
        assert!(!pos.done().await.unwrap());

        sleep(Duration::from_millis(30)).await;
        assert!(pos.done().await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_positioner_move_to_pos() {
        let pos = positioner_with_array("mock:m1", "x", vec![0.0, 2.0, 4.0]);
        pos.move_to_pos(2).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert!((pos.current().await.unwrap() - 4.0).abs() < 1e-9);

        assert!(pos.move_to_pos(3).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_trigger_counting() {
        let trig = MockTrigger::new("mock:scaler");
        trig.set_count_time(0.02).await.unwrap();

        trig.start().await.unwrap();
        assert!(!trig.done().await.unwrap());

        sleep(Duration::from_millis(30)).await;
        assert!(trig.done().await.unwrap());
        assert!(trig.runtime() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_mock_trigger_underrun() {
        let trig = MockTrigger::new("mock:scaler").with_stop().with_underruns(1);
        trig.set_count_time(0.05).await.unwrap();

        trig.start().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert!(trig.done().await.unwrap());
        // first start under-ran: runtime is far below the preset
        assert!(trig.runtime() < Duration::from_millis(25));

        trig.start().await.unwrap();
        sleep(Duration::from_millis(60)).await;
        assert!(trig.runtime() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_mock_counter_accumulates() {
        let counter = MockCounter::new("mock:i0", "i0");
        counter.read(None).await.unwrap();
        counter.read(None).await.unwrap();
        assert_eq!(counter.len(), 2);

        counter.clear();
        assert!(counter.is_empty());
    }

    #[tokio::test]
    async fn test_mock_array_counter_nbins() {
        let counter = MockArrayCounter::new("mock:mca", "mca", 8);
        assert_eq!(counter.nbins_hint(), Some(8));

        counter.read(Some(4)).await.unwrap();
        match counter.data() {
            CounterData::Waveform(waves) => assert_eq!(waves[0].len(), 4),
            other => panic!("unexpected counter data: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mock_meta_channel_requires_connect() {
        let chan = MockMetaChannel::new("Ring current", "mock:ring", "102.3");
        assert!(chan.read_text().await.is_err());

        chan.connect().await.unwrap();
        assert_eq!(chan.read_text().await.unwrap(), "102.3");
    }
}
