//! Data sink interface and in-memory sink.
//!
//! The on-disk scan file format is an external collaborator; the engine
//! talks to it through the [`ScanSink`] trait and hands over borrowed
//! [`ScanFrame`] snapshots at each flush. A CSV sink is provided behind the
//! `storage_csv` feature (see [`storage`]), and [`MemorySink`] records
//! flushes for tests.

pub mod storage;

use crate::core::CounterData;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::PathBuf;

/// Why a flush is happening.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Breakpoint {
    /// Initial write when the file is opened, before any points.
    Start,
    /// Flush at the configured breakpoint index.
    At(usize),
    /// Final write when the run unwinds, complete or aborted.
    Final,
}

/// Borrowed snapshot of everything a sink needs for one flush.
pub struct ScanFrame<'a> {
    /// Column labels for the positioners, in plan order.
    pub positioner_labels: &'a [String],
    /// Actual (read-back) positions, one row per completed point.
    pub pos_actual: &'a [Vec<f64>],
    /// Column labels for the counters, in plan order.
    pub counter_labels: &'a [String],
    /// Accumulated counter buffers, parallel to `counter_labels`.
    pub counters: &'a [CounterData],
    /// Metadata channel readings: (description, address, value).
    pub metadata: &'a [(String, String, String)],
}

impl ScanFrame<'_> {
    /// Number of fully recorded points: the shortest of the actual-position
    /// log and every counter buffer.
    pub fn complete_points(&self) -> usize {
        self.counters
            .iter()
            .map(CounterData::len)
            .chain(std::iter::once(self.pos_actual.len()))
            .min()
            .unwrap_or(0)
    }
}

/// Consumer of scan data flushes.
///
/// `open` resolves and returns the output path; `write_data` is called at
/// the start, at every breakpoint and once at the end; `close` is called
/// during the post-scan phase.
#[async_trait]
pub trait ScanSink: Send + Sync {
    /// Open the output under `name`, returning the resolved path.
    async fn open(&mut self, name: &str, comments: Option<&str>) -> Result<PathBuf>;

    /// Flush the frame. Sinks append rows not yet written.
    async fn write_data(&mut self, frame: &ScanFrame<'_>, breakpoint: Breakpoint) -> Result<()>;

    /// Flush and release the output.
    async fn close(&mut self) -> Result<()>;
}

/// Record of one [`MemorySink`] flush.
#[derive(Clone, Debug)]
pub struct RecordedFlush {
    /// Why the flush happened.
    pub breakpoint: Breakpoint,
    /// `complete_points()` of the flushed frame.
    pub points: usize,
}

#[derive(Default)]
struct MemorySinkInner {
    opened: Option<String>,
    closed: bool,
    flushes: Vec<RecordedFlush>,
    last_rows: Vec<Vec<f64>>,
}

/// Sink that records flushes in memory, for tests.
///
/// Clones share state, so a test can keep a handle after moving the sink
/// into an engine.
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: std::sync::Arc<parking_lot::Mutex<MemorySinkInner>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flushes seen so far.
    pub fn flushes(&self) -> Vec<RecordedFlush> {
        self.inner.lock().flushes.clone()
    }

    /// Actual-position rows from the most recent flush.
    pub fn last_rows(&self) -> Vec<Vec<f64>> {
        self.inner.lock().last_rows.clone()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[async_trait]
impl ScanSink for MemorySink {
    async fn open(&mut self, name: &str, _comments: Option<&str>) -> Result<PathBuf> {
        self.inner.lock().opened = Some(name.to_string());
        Ok(PathBuf::from(format!("memory://{}", name)))
    }

    async fn write_data(&mut self, frame: &ScanFrame<'_>, breakpoint: Breakpoint) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.opened.is_none() {
            return Err(anyhow!("MemorySink: write_data before open"));
        }
        inner.flushes.push(RecordedFlush {
            breakpoint,
            points: frame.complete_points(),
        });
        inner.last_rows = frame.pos_actual.to_vec();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_records_flushes() {
        let mut sink = MemorySink::new();
        sink.open("scan.001", None).await.unwrap();

        let counters = [CounterData::Scalar(vec![1.0, 2.0])];
        let pos_actual = vec![vec![0.0], vec![1.0]];
        let frame = ScanFrame {
            positioner_labels: &["x".to_string()],
            pos_actual: &pos_actual,
            counter_labels: &["i0".to_string()],
            counters: &counters,
            metadata: &[],
        };
        sink.write_data(&frame, Breakpoint::At(1)).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(sink.flushes().len(), 1);
        assert_eq!(sink.flushes()[0].points, 2);
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_memory_sink_rejects_unopened_write() {
        let mut sink = MemorySink::new();
        let frame = ScanFrame {
            positioner_labels: &[],
            pos_actual: &[],
            counter_labels: &[],
            counters: &[],
            metadata: &[],
        };
        assert!(sink.write_data(&frame, Breakpoint::Final).await.is_err());
    }

    #[test]
    fn test_complete_points_is_shortest_column() {
        let counters = [
            CounterData::Scalar(vec![1.0, 2.0, 3.0]),
            CounterData::Scalar(vec![1.0, 2.0]),
        ];
        let pos_actual = vec![vec![0.0], vec![1.0], vec![2.0]];
        let frame = ScanFrame {
            positioner_labels: &[],
            pos_actual: &pos_actual,
            counter_labels: &[],
            counters: &counters,
            metadata: &[],
        };
        assert_eq!(frame.complete_points(), 2);
    }
}
