//! The step-scan orchestrator.
//!
//! `StepScanEngine` drives a [`StepScan`] plan through the run-loop state
//! machine: verification, pre-scan hooks, the double move-to-start, the
//! per-point loop (move, settle, trigger, validate, read), breakpoint
//! flushes, and the post-scan unwind that restores positioner positions and
//! closes the data sink.
//!
//! All waits are bounded polling loops through one `poll_until` primitive:
//! the condition is sampled every instrument tick and the interrupt source
//! is re-checked once per outer tick, so aborts are observed within one
//! tick of any blocking wait. Cancellation is cooperative — external
//! callers set a flag on the [`InterruptSource`] and the engine unwinds
//! through its post-scan phase at the next suspension point, preserving
//! everything already flushed.

use crate::config::ScanSettings;
use crate::core::{Dwelltime, ScanPhase};
use crate::data::{Breakpoint, ScanFrame, ScanSink};
use crate::error::{ScanError, ScanResult};
use crate::interrupt::{unique_varnames, InterruptSource};
use crate::scan::messenger::{PointUpdate, ScanMessenger};
use crate::scan::plan::StepScan;
use crate::scan::regions::hms;
use anyhow::Result;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Outcome of one bounded polling wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PollOutcome {
    /// The condition became true.
    Done,
    /// The timeout elapsed first.
    TimedOut,
    /// An abort was observed at an outer tick.
    Interrupted,
}

/// Poll `condition` every `tick` until it holds, `timeout` elapses, or an
/// abort is observed at an `outer`-spaced interrupt re-check.
async fn poll_until<F, Fut>(
    mut condition: F,
    timeout: Duration,
    tick: Duration,
    outer: Duration,
    interrupts: &InterruptSource,
) -> Result<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let mut last_check = Instant::now();
    loop {
        if condition().await? {
            return Ok(PollOutcome::Done);
        }
        if started.elapsed() >= timeout {
            return Ok(PollOutcome::TimedOut);
        }
        if last_check.elapsed() >= outer {
            last_check = Instant::now();
            if interrupts.check().await?.abort {
                return Ok(PollOutcome::Interrupted);
            }
        }
        sleep(tick).await;
    }
}

/// Which hook phase is being run.
#[derive(Clone, Copy)]
enum HookPhase {
    Pre,
    Post,
    Break(usize),
}

impl HookPhase {
    fn name(&self) -> &'static str {
        match self {
            HookPhase::Pre => "pre_scan",
            HookPhase::Post => "post_scan",
            HookPhase::Break(_) => "at_break",
        }
    }
}

/// Mutable per-execution state, reset at every `run()`.
#[derive(Clone, Debug)]
pub struct ScanProgress {
    /// Current state-machine phase.
    pub phase: ScanPhase,
    /// Zero-based index of the point being (or last) processed.
    pub point: usize,
    /// Total points in the running plan.
    pub npts: usize,
    /// True once a run finished normally.
    pub complete: bool,
    /// Count of point re-executions caused by trigger under-runs.
    pub point_retries: u32,
    /// Wall-clock spent before the loop (verify, hooks, move to start).
    pub init_time: Duration,
    /// Wall-clock spent in the point loop, even if aborted.
    pub loop_time: Duration,
    /// Wall-clock spent unwinding after the loop.
    pub exit_time: Duration,
    /// Total `run()` wall-clock.
    pub run_time: Duration,
    /// Resolved output path of the last run that opened a file.
    pub filename: Option<PathBuf>,
    /// Last error message, if any.
    pub last_error: Option<String>,
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self {
            phase: ScanPhase::Idle,
            point: 0,
            npts: 0,
            complete: false,
            point_retries: 0,
            init_time: Duration::ZERO,
            loop_time: Duration::ZERO,
            exit_time: Duration::ZERO,
            run_time: Duration::ZERO,
            filename: None,
            last_error: None,
        }
    }
}

/// Orchestrator composing a plan, a sink, settings and an interrupt source
/// into the run-loop state machine.
pub struct StepScanEngine {
    plan: StepScan,
    sink: Box<dyn ScanSink>,
    settings: ScanSettings,
    interrupts: Arc<InterruptSource>,
    messenger_cb: Option<Arc<dyn Fn(PointUpdate) + Send + Sync>>,
    progress: ScanProgress,
    pos_actual: Vec<Vec<f64>>,
}

impl StepScanEngine {
    /// Engine over `plan` writing through `sink`, with default settings and
    /// a local interrupt source.
    pub fn new(plan: StepScan, sink: Box<dyn ScanSink>) -> Self {
        Self {
            plan,
            sink,
            settings: ScanSettings::default(),
            interrupts: Arc::new(InterruptSource::local()),
            messenger_cb: None,
            progress: ScanProgress::default(),
            pos_actual: Vec::new(),
        }
    }

    /// Replace the timing/retry settings.
    pub fn with_settings(mut self, settings: ScanSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the interrupt source (e.g. one backed by a remote store).
    pub fn with_interrupts(mut self, interrupts: Arc<InterruptSource>) -> Self {
        self.interrupts = interrupts;
        self
    }

    /// Install a per-point callback, run by a messenger worker off the
    /// control path.
    pub fn with_messenger<F>(mut self, func: F) -> Self
    where
        F: Fn(PointUpdate) + Send + Sync + 'static,
    {
        self.messenger_cb = Some(Arc::new(func));
        self
    }

    /// The plan this engine runs.
    pub fn plan(&self) -> &StepScan {
        &self.plan
    }

    /// The interrupt source; hand to external controllers for
    /// abort/pause/resume.
    pub fn interrupts(&self) -> Arc<InterruptSource> {
        self.interrupts.clone()
    }

    /// State of the current or last run.
    pub fn progress(&self) -> &ScanProgress {
        &self.progress
    }

    /// Execute the scan, writing the output under `filename`. Returns the
    /// resolved output path; an externally aborted run still returns the
    /// path of the partially written file.
    pub async fn run(&mut self, filename: &str, comments: Option<&str>) -> ScanResult<PathBuf> {
        match self.run_inner(filename, comments).await {
            Ok(path) => Ok(path),
            Err(err) => {
                self.progress.phase = ScanPhase::Error;
                self.progress.last_error = Some(err.to_string());
                let _ = self.interrupts.set_error(&err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn run_inner(&mut self, filename: &str, comments: Option<&str>) -> ScanResult<PathBuf> {
        let ts_start = Instant::now();
        self.progress = ScanProgress::default();
        self.pos_actual.clear();

        // VERIFYING: any failure here ends the run with zero motion
        self.progress.phase = ScanPhase::Verifying;
        self.set_info("scan_progress", "verifying scan").await?;
        let npts = match self.plan.verify() {
            Ok(npts) => npts,
            Err(err) => {
                let _ = self.interrupts.set_error(&err.to_string()).await;
                return Err(err);
            }
        };
        self.progress.npts = npts;
        self.interrupts.clear().await.map_err(ScanError::Fault)?;

        // capture pre-scan positions for the post-scan restore moves
        let orig_positions = self
            .plan
            .positioners()
            .current_all()
            .await
            .map_err(ScanError::Fault)?;

        let path = self
            .sink
            .open(filename, comments)
            .await
            .map_err(ScanError::Fault)?;
        self.progress.filename = Some(path.clone());
        self.set_info("filename", &path.display().to_string()).await?;

        self.plan.counters().clear_all();
        self.init_scandata().await?;

        // push the starting dwell to every detector
        let dwelltime = self.plan.dwelltime().clone();
        let min_dwell = dwelltime.min();
        for det in self.plan.detectors() {
            det.set_dwelltime(dwelltime.at(0))
                .await
                .map_err(ScanError::Fault)?;
        }

        let overhead = self.settings.effective_pos_settle() + self.settings.effective_det_settle();
        let time_est = Duration::from_secs_f64(dwelltime.remaining(0, npts).max(0.0))
            + overhead * npts as u32;
        self.set_info("scan_time_estimate", &format!("{}", time_est.as_secs()))
            .await?;
        self.set_info("scan_total_points", &npts.to_string()).await?;

        // PRE_SCAN: connect metadata channels, then run every hook
        self.progress.phase = ScanPhase::PreScan;
        self.set_info("scan_progress", "preparing scan").await?;
        for chan in self.plan.meta_channels() {
            chan.connect().await.map_err(ScanError::Fault)?;
        }
        self.run_hooks(HookPhase::Pre).await?;

        // initial flush: metadata block and column header
        self.flush_data(Breakpoint::Start).await?;

        // MOVING_TO_START: async issue, then a second synchronous move —
        // the double move guards against drift introduced between the two
        self.progress.phase = ScanPhase::MovingToStart;
        self.set_info("scan_progress", "moving to start").await?;
        self.plan
            .positioners()
            .move_to_start(false)
            .await
            .map_err(ScanError::Fault)?;
        self.plan
            .positioners()
            .move_to_start(true)
            .await
            .map_err(ScanError::Fault)?;
        let _ = self
            .plan
            .positioners()
            .current_all()
            .await
            .map_err(ScanError::Fault)?;

        let messenger = self.messenger_cb.clone().map(|cb| {
            ScanMessenger::start(
                npts,
                self.settings.messenger_poll,
                self.settings.messenger_timeout,
                move |update| cb(update),
            )
        });

        let nbins = self.plan.counters().nbins();
        let trigger_has_stop = self.plan.triggers().has_stop();
        let half_dwell = Duration::from_secs_f64((min_dwell / 2.0).max(0.0));
        let presleep = half_dwell.max(self.settings.instrument_tick);

        let ts_init = Instant::now();
        self.progress.init_time = ts_init - ts_start;
        self.progress.phase = ScanPhase::Looping;
        self.set_info("scan_progress", "starting scan").await?;
        tracing::info!(npts, "scan loop starting");

        let mut i = 0usize;
        let mut retries_this_point = 0u32;
        let mut aborted = false;

        'points: while i < npts {
            self.progress.point = i;

            // (a) loop-head interrupt check, pause busy-wait
            let flags = self.interrupts.check().await.map_err(ScanError::Fault)?;
            if flags.abort {
                aborted = true;
                break 'points;
            }
            if flags.pause {
                self.progress.phase = ScanPhase::Paused;
                self.set_info("scan_progress", &format!("paused at point {}/{}", i + 1, npts))
                    .await?;
                loop {
                    sleep(self.settings.outer_tick).await;
                    let flags = self.interrupts.check().await.map_err(ScanError::Fault)?;
                    if flags.abort {
                        aborted = true;
                        break 'points;
                    }
                    if flags.resume || !flags.pause {
                        break;
                    }
                }
                self.interrupts.clear_pause().await.map_err(ScanError::Fault)?;
                self.progress.phase = ScanPhase::Looping;
                self.set_info("scan_progress", "resumed").await?;
            }

            // (b) issue the next moves
            self.plan
                .positioners()
                .move_to_pos(i)
                .await
                .map_err(ScanError::Fault)?;

            // (c) publish the previous point's data while motion is in
            // flight, one point behind
            if i > 1 {
                self.publish_scandata().await?;
            }

            // (d) per-point dwell
            if dwelltime.varies() {
                for det in self.plan.detectors() {
                    det.set_dwelltime(dwelltime.at(i))
                        .await
                        .map_err(ScanError::Fault)?;
                }
            }

            // (e) wait for every positioner, bounded by pos_maxmove_time
            match self.wait_positioners().await? {
                PollOutcome::Done => {}
                PollOutcome::TimedOut => {
                    // best-effort: one slow axis must not kill the scan
                    tracing::warn!(
                        point = i,
                        timeout = ?self.settings.pos_maxmove_time,
                        "positioners still moving; proceeding"
                    );
                }
                PollOutcome::Interrupted => {
                    aborted = true;
                    break 'points;
                }
            }

            // (f) positioner settle
            sleep(self.settings.effective_pos_settle()).await;
            if self.interrupts.check().await.map_err(ScanError::Fault)?.abort {
                aborted = true;
                break 'points;
            }

            // (g) start triggers, sleep half the minimum dwell, poll
            self.plan
                .triggers()
                .start_all()
                .await
                .map_err(ScanError::Fault)?;
            sleep(presleep).await;
            match self.wait_triggers().await? {
                PollOutcome::Done | PollOutcome::TimedOut => {}
                // (h) interrupted during counting: abandon the point
                PollOutcome::Interrupted => {
                    aborted = true;
                    break 'points;
                }
            }

            // (i) stop triggers and judge point validity
            let mut point_ok = true;
            if trigger_has_stop {
                self.plan
                    .triggers()
                    .stop_all()
                    .await
                    .map_err(ScanError::Fault)?;
                if let Some(runtime) = self.plan.triggers().min_runtime() {
                    point_ok = runtime >= half_dwell;
                }
                if !point_ok {
                    // give the hardware a moment and re-judge before retrying
                    sleep(self.settings.instrument_tick * 5).await;
                    if let Some(runtime) = self.plan.triggers().min_runtime() {
                        point_ok = runtime >= half_dwell;
                    }
                }
                if self.interrupts.check().await.map_err(ScanError::Fault)?.abort {
                    aborted = true;
                    break 'points;
                }
            }
            if !point_ok {
                self.progress.point_retries += 1;
                retries_this_point += 1;
                tracing::warn!(point = i, retries = retries_this_point, "trigger under-ran dwell; retrying point");
                if let Some(cap) = self.settings.max_point_retries {
                    if retries_this_point > cap {
                        return Err(ScanError::Fault(anyhow::anyhow!(
                            "point {} exceeded retry cap of {}",
                            i,
                            cap
                        )));
                    }
                }
                sleep(self.settings.effective_det_settle()).await;
                continue 'points;
            }

            // (j) detector settle, wait out explicit stops
            sleep(self.settings.effective_det_settle()).await;
            if trigger_has_stop {
                self.plan
                    .triggers()
                    .wait_for_stop_all()
                    .await
                    .map_err(ScanError::Fault)?;
            }

            // (k) read counters, record actual positions, publish progress
            self.plan
                .counters()
                .read_all(nbins)
                .await
                .map_err(ScanError::Fault)?;
            let actual = self
                .plan
                .positioners()
                .current_all()
                .await
                .map_err(ScanError::Fault)?;
            self.pos_actual.push(actual);
            retries_this_point = 0;

            if let Some(messenger) = &messenger {
                messenger.set_point(i + 1);
            }
            self.publish_progress(i + 1, npts, &dwelltime).await?;

            if self.plan.breakpoints().contains(&i) {
                self.progress.phase = ScanPhase::Breakpoint;
                self.run_hooks(HookPhase::Break(i)).await?;
                self.flush_data(Breakpoint::At(i)).await?;
                self.progress.phase = ScanPhase::Looping;
            }

            i += 1;
        }

        let ts_loop = Instant::now();
        self.progress.loop_time = ts_loop - ts_init;

        // POST_SCAN: flush, restore positions, close, hooks
        self.progress.phase = ScanPhase::PostScan;
        self.set_info("scan_progress", "finishing").await?;
        self.publish_scandata().await?;
        if aborted {
            tracing::warn!(point = self.progress.point, npts, "scan aborted");
            self.set_info(
                "scan_progress",
                &format!("scan aborted at point {}/{}", self.progress.point + 1, npts),
            )
            .await?;
        }

        self.plan
            .positioners()
            .restore(&orig_positions)
            .await
            .map_err(ScanError::Fault)?;
        self.flush_data(Breakpoint::Final).await?;
        self.sink.close().await.map_err(ScanError::Fault)?;
        self.interrupts.clear().await.map_err(ScanError::Fault)?;

        self.run_hooks(HookPhase::Post).await?;

        if let Some(messenger) = messenger {
            // the sentinel shares the cell with the point counter; let the
            // worker observe the final point before it is overwritten
            sleep(self.settings.messenger_poll * 2).await;
            messenger.finish();
            messenger.join().await;
        }

        self.progress.complete = !aborted;
        self.progress.phase = if aborted {
            ScanPhase::Aborted
        } else {
            ScanPhase::Complete
        };
        self.set_info(
            "scan_progress",
            &format!("scan complete. Wrote {}", path.display()),
        )
        .await?;

        let ts_exit = Instant::now();
        self.progress.exit_time = ts_exit - ts_loop;
        self.progress.run_time = ts_exit - ts_start;
        tracing::info!(
            complete = self.progress.complete,
            points = self.pos_actual.len(),
            path = %path.display(),
            "scan finished"
        );
        Ok(path)
    }

    async fn wait_positioners(&self) -> ScanResult<PollOutcome> {
        poll_until(
            || self.plan.positioners().all_done(),
            self.settings.pos_maxmove_time,
            self.settings.instrument_tick,
            self.settings.outer_tick,
            &self.interrupts,
        )
        .await
        .map_err(ScanError::Fault)
    }

    async fn wait_triggers(&self) -> ScanResult<PollOutcome> {
        poll_until(
            || self.plan.triggers().all_done(),
            self.settings.det_maxcount_time,
            self.settings.instrument_tick,
            self.settings.outer_tick,
            &self.interrupts,
        )
        .await
        .map_err(ScanError::Fault)
    }

    /// Run one hook phase across positioners then detectors, in plan order,
    /// collecting every failure before raising.
    async fn run_hooks(&self, phase: HookPhase) -> ScanResult<()> {
        let mut failures = Vec::new();
        for pos in self.plan.positioners().iter() {
            let out = match phase {
                HookPhase::Pre => pos.pre_scan().await,
                HookPhase::Post => pos.post_scan().await,
                HookPhase::Break(bp) => pos.at_break(bp).await,
            };
            if let Err(err) = out {
                failures.push(err.to_string());
            }
        }
        for det in self.plan.detectors() {
            let out = match phase {
                HookPhase::Pre => det.pre_scan().await,
                HookPhase::Post => det.post_scan().await,
                HookPhase::Break(bp) => det.at_break(bp).await,
            };
            if let Err(err) = out {
                failures.push(err.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ScanError::hook(phase.name(), failures))
        }
    }

    async fn set_info(&self, key: &str, value: &str) -> ScanResult<()> {
        self.interrupts
            .set_info(key, value)
            .await
            .map_err(ScanError::Fault)
    }

    async fn publish_progress(
        &self,
        cpt: usize,
        npts: usize,
        dwelltime: &Dwelltime,
    ) -> ScanResult<()> {
        let overhead = self.settings.effective_pos_settle() + self.settings.effective_det_settle();
        let time_left = Duration::from_secs_f64(dwelltime.remaining(cpt, npts).max(0.0))
            + overhead * npts.saturating_sub(cpt) as u32;
        self.set_info("scan_time_estimate", &format!("{}", time_left.as_secs()))
            .await?;
        let msg = format!("Point {}/{}, time left: {}", cpt, npts, hms(time_left));
        if cpt % self.settings.message_points.max(1) == 0 {
            tracing::info!("{}", msg);
        }
        self.set_info("scan_progress", &msg).await
    }

    /// Register positioner arrays and counter channels with the store.
    async fn init_scandata(&self) -> ScanResult<()> {
        if !self.interrupts.has_store() {
            return Ok(());
        }
        self.interrupts
            .clear_scandata()
            .await
            .map_err(ScanError::Fault)?;
        let names = self.column_varnames();
        let n_pos = self.plan.positioners().len();
        for (name, pos) in names.iter().zip(self.plan.positioners().iter()) {
            self.interrupts
                .set_scandata(name, &pos.array())
                .await
                .map_err(ScanError::Fault)?;
        }
        for name in &names[n_pos..] {
            self.interrupts
                .set_scandata(name, &[])
                .await
                .map_err(ScanError::Fault)?;
        }
        Ok(())
    }

    /// Push the accumulated counter buffers to the store.
    async fn publish_scandata(&self) -> ScanResult<()> {
        if !self.interrupts.has_store() {
            return Ok(());
        }
        let names = self.column_varnames();
        let n_pos = self.plan.positioners().len();
        let snapshots = self.plan.counters().data_snapshots();
        for (name, data) in names[n_pos..].iter().zip(&snapshots) {
            self.interrupts
                .set_scandata(name, &data.as_scalar_series())
                .await
                .map_err(ScanError::Fault)?;
        }
        Ok(())
    }

    /// Store-safe unique names for positioner then counter columns.
    fn column_varnames(&self) -> Vec<String> {
        let mut labels = self.plan.positioners().labels();
        labels.extend(self.plan.counters().labels());
        unique_varnames(&labels)
    }

    async fn read_meta(&self) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        for chan in self.plan.meta_channels() {
            let value = match chan.read_text().await {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(address = chan.address(), %err, "metadata read failed");
                    "unknown".to_string()
                }
            };
            out.push((
                chan.description().to_string(),
                chan.address().to_string(),
                value,
            ));
        }
        out
    }

    async fn flush_data(&mut self, breakpoint: Breakpoint) -> ScanResult<()> {
        let positioner_labels = self.plan.positioners().labels();
        let counter_labels = self.plan.counters().labels();
        let counters = self.plan.counters().data_snapshots();
        let metadata = self.read_meta().await;
        let frame = ScanFrame {
            positioner_labels: &positioner_labels,
            pos_actual: &self.pos_actual,
            counter_labels: &counter_labels,
            counters: &counters,
            metadata: &metadata,
        };
        self.sink
            .write_data(&frame, breakpoint)
            .await
            .map_err(ScanError::Fault)
    }
}
