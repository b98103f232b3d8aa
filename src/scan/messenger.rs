//! Per-point progress reporting off the control path.
//!
//! `ScanMessenger` runs a user-supplied callback once per completed scan
//! point without ever stalling motion or trigger timing: the control task
//! writes the current point into one shared atomic, and an independent
//! worker task polls the cell and invokes the callback on any observed
//! change. The worker terminates when the cell is set to the `FINISHED`
//! sentinel, or after the cell has been unchanged for longer than the
//! staleness timeout, whichever comes first.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Sentinel written into the shared cell to stop the worker.
pub const FINISHED: i64 = -1;

/// Point-progress update handed to the messenger callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PointUpdate {
    /// Current point number (1-based, as published by the engine).
    pub cpt: usize,
    /// Total points in the scan.
    pub npts: usize,
}

/// Worker task invoking a callback once per observed current-point change.
pub struct ScanMessenger {
    cell: Arc<AtomicI64>,
    handle: JoinHandle<()>,
}

impl ScanMessenger {
    /// Spawn the worker. The shared cell starts at 0, so the callback fires
    /// for the first time when the cell first moves away from 0.
    pub fn start<F>(npts: usize, poll: Duration, timeout: Duration, func: F) -> Self
    where
        F: Fn(PointUpdate) + Send + Sync + 'static,
    {
        let cell = Arc::new(AtomicI64::new(0));
        let watched = cell.clone();
        let handle = tokio::spawn(async move {
            let mut last = watched.load(Ordering::SeqCst);
            let mut changed_at = Instant::now();
            loop {
                sleep(poll).await;
                let value = watched.load(Ordering::SeqCst);
                if value != last {
                    last = value;
                    changed_at = Instant::now();
                    if value != FINISHED {
                        func(PointUpdate {
                            cpt: value.max(0) as usize,
                            npts,
                        });
                    }
                }
                if value == FINISHED || changed_at.elapsed() > timeout {
                    return;
                }
            }
        });
        Self { cell, handle }
    }

    /// Publish the current point. Called only by the control task.
    pub fn set_point(&self, cpt: usize) {
        self.cell.store(cpt as i64, Ordering::SeqCst);
    }

    /// Ask the worker to terminate after its next poll.
    pub fn finish(&self) {
        self.cell.store(FINISHED, Ordering::SeqCst);
    }

    /// Whether the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker task to exit.
    pub async fn join(mut self) {
        let _ = (&mut self.handle).await;
    }
}

impl Drop for ScanMessenger {
    fn drop(&mut self) {
        // a messenger dropped without finish()/join() must not linger for
        // the staleness timeout
        self.handle.abort();
    }
}
