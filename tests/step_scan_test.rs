//! End-to-end scans over mock instruments.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use stepscan::config::ScanSettings;
use stepscan::core::{Counter, Dwelltime, Positioner, ScanPhase};
use stepscan::data::{Breakpoint, MemorySink, ScanSink};
use stepscan::error::ScanError;
use stepscan::instrument::mock::{
    positioner_with_array, MockCounter, MockMetaChannel, MockPositioner, MockTrigger,
};
use stepscan::interrupt::{InterruptSource, MemoryStore, StatusStore};
use stepscan::scan::{Region, RegionBuilder, SimpleDetector, StepScan, StepScanEngine};

fn fast_settings() -> ScanSettings {
    ScanSettings {
        pos_settle_time: Duration::from_millis(1),
        det_settle_time: Duration::from_millis(1),
        instrument_tick: Duration::from_millis(1),
        outer_tick: Duration::from_millis(10),
        messenger_poll: Duration::from_millis(10),
        ..ScanSettings::default()
    }
}

struct Rig {
    scan: StepScan,
    positioner: Arc<MockPositioner>,
    trigger: Arc<MockTrigger>,
    counter: Arc<MockCounter>,
}

fn rig(targets: Vec<f64>, trigger: MockTrigger) -> Rig {
    let positioner = positioner_with_array("mock:m1", "x", targets);
    let trigger = Arc::new(trigger);
    let counter = Arc::new(MockCounter::new("mock:i0", "i0"));
    let detector =
        SimpleDetector::new("det", trigger.clone()).with_counter(counter.clone());

    let mut scan = StepScan::new();
    scan.add_positioner(positioner.clone());
    scan.add_detector(Arc::new(detector));
    Rig {
        scan,
        positioner,
        trigger,
        counter,
    }
}

#[tokio::test]
async fn full_scan_runs_every_point() {
    let rig = rig(vec![1.0, 2.0, 3.0, 4.0, 5.0], MockTrigger::new("mock:scaler"));
    let mut scan = rig.scan;
    scan.set_dwelltime(Dwelltime::Fixed(0.02));

    let meta = Arc::new(MockMetaChannel::new("Ring current", "mock:ring", "102.3"));
    scan.add_meta_channel(meta.clone());

    let sink = MemorySink::new();
    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_cb = seen.clone();

    let mut engine = StepScanEngine::new(scan, Box::new(sink.clone()))
        .with_settings(fast_settings())
        .with_messenger(move |update| seen_in_cb.lock().unwrap().push(update.cpt));

    let path = engine.run("scan.001", Some("full run")).await.unwrap();
    assert_eq!(path.to_string_lossy(), "memory://scan.001");

    // exactly five point iterations, each recorded once
    assert_eq!(rig.counter.len(), 5);
    assert_eq!(sink.last_rows().len(), 5);
    assert_eq!(rig.trigger.starts(), 5);

    let progress = engine.progress();
    assert!(progress.complete);
    assert_eq!(progress.phase, ScanPhase::Complete);
    assert_eq!(progress.npts, 5);
    assert_eq!(progress.point_retries, 0);

    // start flush plus final flush, no breakpoints configured
    let flushes = sink.flushes();
    assert_eq!(flushes.len(), 2);
    assert_eq!(flushes[0].breakpoint, Breakpoint::Start);
    assert_eq!(flushes[0].points, 0);
    assert_eq!(flushes[1].breakpoint, Breakpoint::Final);
    assert_eq!(flushes[1].points, 5);
    assert!(sink.is_closed());

    // metadata channel was connected during pre-scan
    assert!(meta.is_connected());

    // the messenger saw the scan reach the final point
    let seen = seen.lock().unwrap();
    assert_eq!(seen.last().copied(), Some(5));
}

#[tokio::test]
async fn mismatched_arrays_issue_zero_motion() {
    let p1 = positioner_with_array("mock:m1", "x", (0..10).map(f64::from).collect());
    let p2 = positioner_with_array("mock:m2", "y", (0..8).map(f64::from).collect());

    let mut scan = StepScan::new();
    scan.add_positioner(p1.clone());
    scan.add_positioner(p2.clone());
    scan.add_counter(Arc::new(MockCounter::new("mock:i0", "i0")));

    let mut engine =
        StepScanEngine::new(scan, Box::new(MemorySink::new())).with_settings(fast_settings());

    let err = engine.run("scan.001", None).await.unwrap_err();
    assert!(matches!(err, ScanError::Verification(_)));
    assert_eq!(engine.progress().phase, ScanPhase::Error);
    assert_eq!(p1.moves_issued(), 0);
    assert_eq!(p2.moves_issued(), 0);
}

#[tokio::test]
async fn pre_scan_hook_failure_aborts_before_motion() {
    let positioner = Arc::new(MockPositioner::new("mock:m1", "x").with_failing_pre_scan());
    positioner.set_array(vec![0.0, 1.0, 2.0]);

    let mut scan = StepScan::new();
    scan.add_positioner(positioner.clone());
    scan.add_counter(Arc::new(MockCounter::new("mock:i0", "i0")));

    let mut engine =
        StepScanEngine::new(scan, Box::new(MemorySink::new())).with_settings(fast_settings());

    let err = engine.run("scan.001", None).await.unwrap_err();
    match err {
        ScanError::Hook { phase, failures } => {
            assert_eq!(phase, "pre_scan");
            assert_eq!(failures.len(), 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(positioner.moves_issued(), 0);
}

#[tokio::test]
async fn abort_mid_scan_unwinds_and_restores() {
    let rig = rig(vec![1.0, 2.0, 3.0, 4.0, 5.0], MockTrigger::new("mock:scaler"));
    let mut scan = rig.scan;
    scan.set_dwelltime(Dwelltime::Fixed(0.02));

    let sink = MemorySink::new();
    let interrupts = Arc::new(InterruptSource::local());
    let abort_handle = interrupts.clone();

    let mut engine = StepScanEngine::new(scan, Box::new(sink.clone()))
        .with_settings(fast_settings())
        .with_interrupts(interrupts)
        .with_messenger(move |update| {
            if update.cpt == 2 {
                abort_handle.request_abort();
            }
        });

    // an aborted run still returns the output path of the partial file
    let path = engine.run("scan.001", None).await.unwrap();
    assert_eq!(path.to_string_lossy(), "memory://scan.001");

    let progress = engine.progress();
    assert!(!progress.complete);
    assert_eq!(progress.phase, ScanPhase::Aborted);
    assert!(progress.point >= 2 && progress.point < 5);
    assert_eq!(sink.last_rows().len(), progress.point);

    // the final flush still happened and the sink was closed
    let flushes = sink.flushes();
    assert_eq!(flushes.last().unwrap().breakpoint, Breakpoint::Final);
    assert!(sink.is_closed());

    // return-to-start motion was issued for the positioner
    tokio::time::sleep(Duration::from_millis(30)).await;
    let current = rig.positioner.current().await.unwrap();
    assert!(current.abs() < 0.5, "positioner not restored: {current}");
}

#[tokio::test]
async fn trigger_underrun_retries_same_point_once() {
    let rig = rig(
        vec![1.0, 2.0, 3.0],
        MockTrigger::new("mock:scaler").with_stop().with_underruns(1),
    );
    let mut scan = rig.scan;
    scan.set_dwelltime(Dwelltime::Fixed(0.05));

    let mut engine =
        StepScanEngine::new(scan, Box::new(MemorySink::new())).with_settings(fast_settings());

    engine.run("scan.001", None).await.unwrap();

    let progress = engine.progress();
    assert!(progress.complete);
    assert_eq!(progress.point_retries, 1);
    // one extra start for the re-executed point; the discarded attempt
    // never reached the counters
    assert_eq!(rig.trigger.starts(), 4);
    assert_eq!(rig.counter.len(), 3);
}

#[tokio::test]
async fn retry_cap_turns_persistent_underrun_into_error() {
    let rig = rig(
        vec![1.0, 2.0],
        MockTrigger::new("mock:scaler").with_stop().with_underruns(100),
    );
    let mut scan = rig.scan;
    scan.set_dwelltime(Dwelltime::Fixed(0.05));

    let settings = ScanSettings {
        max_point_retries: Some(2),
        ..fast_settings()
    };
    let mut engine = StepScanEngine::new(scan, Box::new(MemorySink::new())).with_settings(settings);

    let err = engine.run("scan.001", None).await.unwrap_err();
    assert!(err.to_string().contains("retry cap"));
    assert_eq!(engine.progress().phase, ScanPhase::Error);
}

#[tokio::test]
async fn breakpoint_runs_hooks_and_flushes() {
    let rig = rig(vec![1.0, 2.0, 3.0, 4.0], MockTrigger::new("mock:scaler"));
    let mut scan = rig.scan;
    scan.set_dwelltime(Dwelltime::Fixed(0.02));
    scan.add_breakpoint(1);

    let sink = MemorySink::new();
    let mut engine =
        StepScanEngine::new(scan, Box::new(sink.clone())).with_settings(fast_settings());

    engine.run("scan.001", None).await.unwrap();

    let flushes = sink.flushes();
    assert_eq!(flushes.len(), 3);
    assert_eq!(flushes[1].breakpoint, Breakpoint::At(1));
    assert_eq!(flushes[1].points, 2);
    assert_eq!(flushes[2].breakpoint, Breakpoint::Final);
    assert_eq!(flushes[2].points, 4);

    // the positioner's at-break hook ran exactly once
    assert_eq!(rig.positioner.at_break_calls(), 1);
}

#[tokio::test]
async fn pause_and_resume_reenter_same_point() {
    let rig = rig(vec![1.0, 2.0, 3.0], MockTrigger::new("mock:scaler"));
    let mut scan = rig.scan;
    scan.set_dwelltime(Dwelltime::Fixed(0.02));

    let interrupts = Arc::new(InterruptSource::local());
    let pause_handle = interrupts.clone();
    let resume_handle = interrupts.clone();

    let mut engine = StepScanEngine::new(scan, Box::new(MemorySink::new()))
        .with_settings(fast_settings())
        .with_interrupts(interrupts)
        .with_messenger(move |update| {
            if update.cpt == 1 {
                pause_handle.request_pause();
            }
        });

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        resume_handle.request_resume();
    });

    engine.run("scan.001", None).await.unwrap();

    let progress = engine.progress();
    assert!(progress.complete);
    assert_eq!(rig.counter.len(), 3);
    // the pause held the loop for at least the resume delay
    assert!(progress.loop_time >= Duration::from_millis(120));
}

#[tokio::test]
async fn store_backed_abort_and_data_publishing() {
    let rig = rig(
        (0..10).map(|i| f64::from(i) + 1.0).collect(),
        MockTrigger::new("mock:scaler"),
    );
    let mut scan = rig.scan;
    scan.set_dwelltime(Dwelltime::Fixed(0.02));

    let store = Arc::new(MemoryStore::new());
    let interrupts = Arc::new(InterruptSource::with_store(store.clone()));

    let mut engine = StepScanEngine::new(scan, Box::new(MemorySink::new()))
        .with_settings(fast_settings())
        .with_interrupts(interrupts);

    let abort_store = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        abort_store.set_info("request_abort", "1").await.unwrap();
    });

    engine.run("scan.001", None).await.unwrap();

    let progress = engine.progress();
    assert!(!progress.complete);
    assert_eq!(progress.phase, ScanPhase::Aborted);
    assert!(progress.point < 10);

    // columns were registered under sanitized names and the abort request
    // was cleared on the way out
    let keys = store.scandata_keys().await;
    assert!(keys.contains(&"x".to_string()));
    assert!(keys.contains(&"i0".to_string()));
    assert!(!store.get_info_bool("request_abort").await.unwrap());
    assert!(store.info("filename").await.is_some());
}

#[tokio::test]
async fn per_point_dwell_is_pushed_to_detectors() {
    let rig = rig(vec![1.0, 2.0, 3.0], MockTrigger::new("mock:scaler"));
    let mut scan = rig.scan;
    scan.set_dwelltime(Dwelltime::PerPoint(vec![0.03, 0.02, 0.01]));

    let mut engine =
        StepScanEngine::new(scan, Box::new(MemorySink::new())).with_settings(fast_settings());

    engine.run("scan.001", None).await.unwrap();

    assert!(engine.progress().complete);
    // the last pushed preset is the final point's dwell
    assert_eq!(rig.trigger.count_time(), Duration::from_millis(10));
}

#[tokio::test]
async fn region_built_scan_drives_engine() {
    let mut builder = RegionBuilder::with_e0(7112.0);
    builder
        .add_region(
            Region::new(-10.0, 10.0)
                .step(5.0)
                .dwell(0.02)
                .dwell_final(0.01)
                .dwell_weight(1.0),
        )
        .unwrap();

    let positioner = positioner_with_array("mock:mono", "energy", builder.points().to_vec());
    let counter = Arc::new(MockCounter::new("mock:i0", "i0"));
    let mut scan = StepScan::new();
    scan.add_positioner(positioner);
    scan.add_detector(Arc::new(
        SimpleDetector::new("det", Arc::new(MockTrigger::new("mock:scaler")))
            .with_counter(counter.clone()),
    ));
    scan.set_dwelltime(Dwelltime::PerPoint(builder.dwelltimes().to_vec()));

    let npts = builder.len();
    assert_eq!(scan.verify().unwrap(), npts);

    let mut engine =
        StepScanEngine::new(scan, Box::new(MemorySink::new())).with_settings(fast_settings());
    engine.run("xafs.001", None).await.unwrap();

    assert_eq!(counter.len(), npts);
    assert!(engine.progress().complete);
}

#[tokio::test]
async fn memory_sink_rejects_write_without_open() {
    let mut sink = MemorySink::new();
    let frame = stepscan::data::ScanFrame {
        positioner_labels: &[],
        pos_actual: &[],
        counter_labels: &[],
        counters: &[],
        metadata: &[],
    };
    assert!(sink.write_data(&frame, Breakpoint::Final).await.is_err());
}
