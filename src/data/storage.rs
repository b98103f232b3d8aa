//! CSV scan file sink with clean feature flag handling.
use crate::data::{Breakpoint, ScanFrame, ScanSink};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

// ============================================================================
// CSV Sink
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use anyhow::Context;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    /// Scan file sink writing one CSV row per point.
    ///
    /// The file opens with a `#`-commented header block (creation time, user
    /// comments, metadata channel readings), then a column header of point
    /// index, positioner read-backs and counter values. Flushes append only
    /// rows not yet written, so breakpoint flushes and the final write
    /// produce a single coherent table. With `auto_increment` (the default)
    /// an existing file is never clobbered; a numeric suffix is bumped until
    /// the name is free.
    pub struct CsvSink {
        dir: PathBuf,
        auto_increment: bool,
        path: PathBuf,
        file: Option<File>,
        writer: Option<csv::Writer<File>>,
        rows_written: usize,
    }

    impl CsvSink {
        /// Sink writing under `dir` with auto-incrementing names.
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self {
                dir: dir.into(),
                auto_increment: true,
                path: PathBuf::new(),
                file: None,
                writer: None,
                rows_written: 0,
            }
        }

        /// Allow overwriting an existing file instead of incrementing.
        pub fn overwrite(mut self) -> Self {
            self.auto_increment = false;
            self
        }

        fn resolve_path(&self, name: &str) -> PathBuf {
            let mut path = self.dir.join(name);
            if !self.auto_increment {
                return path;
            }
            while path.exists() {
                path = bump_numeric_suffix(&path);
            }
            path
        }
    }

    /// `scan.001` -> `scan.002`; names without a numeric suffix get `.001`.
    fn bump_numeric_suffix(path: &Path) -> PathBuf {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("scan");
        let bumped = match name.rsplit_once('.') {
            Some((stem, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => {
                let width = suffix.len().max(3);
                let next = suffix.parse::<u64>().unwrap_or(0) + 1;
                format!("{}.{:0width$}", stem, next, width = width)
            }
            _ => format!("{}.001", name),
        };
        path.with_file_name(bumped)
    }

    #[async_trait]
    impl ScanSink for CsvSink {
        async fn open(&mut self, name: &str, comments: Option<&str>) -> Result<PathBuf> {
            if !self.dir.exists() {
                std::fs::create_dir_all(&self.dir).with_context(|| {
                    format!("Failed to create scan directory at {:?}", self.dir)
                })?;
            }
            self.path = self.resolve_path(name);
            let mut file = File::create(&self.path)
                .with_context(|| format!("Failed to create scan file at {:?}", self.path))?;

            writeln!(file, "# Scan file created {}", chrono::Utc::now().to_rfc3339())
                .context("Failed to write scan file header")?;
            for line in comments.unwrap_or("").lines() {
                writeln!(file, "# {}", line).context("Failed to write scan file comments")?;
            }

            self.file = Some(file);
            self.writer = None;
            self.rows_written = 0;
            tracing::info!(path = %self.path.display(), "CSV sink opened");
            Ok(self.path.clone())
        }

        async fn write_data(&mut self, frame: &ScanFrame<'_>, breakpoint: Breakpoint) -> Result<()> {
            if let Some(mut file) = self.file.take() {
                // first flush: metadata block, then the column header
                for (desc, addr, value) in frame.metadata {
                    writeln!(file, "# {} ({}): {}", desc, addr, value)
                        .context("Failed to write metadata to scan file")?;
                }
                let mut writer = csv::Writer::from_writer(file);
                let header: Vec<String> = std::iter::once("point".to_string())
                    .chain(frame.positioner_labels.iter().cloned())
                    .chain(frame.counter_labels.iter().cloned())
                    .collect();
                writer
                    .write_record(&header)
                    .context("Failed to write scan file column header")?;
                self.writer = Some(writer);
            }

            let writer = self
                .writer
                .as_mut()
                .context("CsvSink: write_data before open")?;

            let columns: Vec<Vec<f64>> = frame
                .counters
                .iter()
                .map(|c| c.as_scalar_series())
                .collect();
            let n = frame.complete_points();
            for i in self.rows_written..n {
                let mut record: Vec<String> = Vec::with_capacity(1 + columns.len() + 4);
                record.push(i.to_string());
                if let Some(row) = frame.pos_actual.get(i) {
                    record.extend(row.iter().map(|v| format!("{:.6}", v)));
                }
                record.extend(columns.iter().map(|col| format!("{:.6}", col[i])));
                writer
                    .write_record(&record)
                    .context("Failed to write data row to scan file")?;
            }
            self.rows_written = self.rows_written.max(n);
            writer.flush().context("Failed to flush scan file")?;
            tracing::debug!(?breakpoint, rows = self.rows_written, "CSV sink flushed");
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.flush().context("Failed to flush scan file on close")?;
            }
            self.file = None;
            tracing::info!(path = %self.path.display(), "CSV sink closed");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::CounterData;

        fn frame<'a>(
            pos_labels: &'a [String],
            pos_actual: &'a [Vec<f64>],
            counter_labels: &'a [String],
            counters: &'a [CounterData],
        ) -> ScanFrame<'a> {
            ScanFrame {
                positioner_labels: pos_labels,
                pos_actual,
                counter_labels,
                counters,
                metadata: &[],
            }
        }

        #[tokio::test]
        async fn test_csv_sink_appends_rows_across_flushes() {
            let dir = tempfile::tempdir().unwrap();
            let mut sink = CsvSink::new(dir.path());
            let path = sink.open("scan.001", Some("test run")).await.unwrap();

            let pos_labels = vec!["x".to_string()];
            let counter_labels = vec!["i0".to_string()];

            let pos_actual = vec![vec![0.0], vec![1.0]];
            let counters = [CounterData::Scalar(vec![10.0, 11.0])];
            sink.write_data(
                &frame(&pos_labels, &pos_actual, &counter_labels, &counters),
                Breakpoint::At(1),
            )
            .await
            .unwrap();

            let pos_actual = vec![vec![0.0], vec![1.0], vec![2.0]];
            let counters = [CounterData::Scalar(vec![10.0, 11.0, 12.0])];
            sink.write_data(
                &frame(&pos_labels, &pos_actual, &counter_labels, &counters),
                Breakpoint::Final,
            )
            .await
            .unwrap();
            sink.close().await.unwrap();

            let text = std::fs::read_to_string(&path).unwrap();
            let data_rows: Vec<&str> = text
                .lines()
                .filter(|l| !l.starts_with('#') && !l.starts_with("point"))
                .collect();
            assert_eq!(data_rows.len(), 3);
            assert!(text.contains("# test run"));
        }

        #[tokio::test]
        async fn test_csv_sink_auto_increments() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("scan.001"), "existing").unwrap();

            let mut sink = CsvSink::new(dir.path());
            let path = sink.open("scan.001", None).await.unwrap();
            assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("scan.002"));
            assert_eq!(
                std::fs::read_to_string(dir.path().join("scan.001")).unwrap(),
                "existing"
            );
        }

        #[test]
        fn test_bump_numeric_suffix() {
            assert_eq!(
                bump_numeric_suffix(Path::new("/data/scan.009")),
                PathBuf::from("/data/scan.010")
            );
            assert_eq!(
                bump_numeric_suffix(Path::new("/data/scan.dat")),
                PathBuf::from("/data/scan.dat.001")
            );
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::ScanError;

    /// Placeholder when the `storage_csv` feature is compiled out.
    pub struct CsvSink;

    impl CsvSink {
        /// Placeholder constructor; all operations fail.
        pub fn new(_dir: impl Into<PathBuf>) -> Self {
            Self
        }
    }

    #[async_trait]
    impl ScanSink for CsvSink {
        async fn open(&mut self, _name: &str, _comments: Option<&str>) -> Result<PathBuf> {
            Err(ScanError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn write_data(
            &mut self,
            _frame: &ScanFrame<'_>,
            _breakpoint: Breakpoint,
        ) -> Result<()> {
            Err(ScanError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn close(&mut self) -> Result<()> {
            Err(ScanError::FeatureNotEnabled("storage_csv".to_string()).into())
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvSink;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvSink;
