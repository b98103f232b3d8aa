//! Custom error types for the scan engine.
//!
//! This module defines the primary error type, `ScanError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes a scan can hit, from plan
//! verification problems to instrument faults surfaced mid-run.
//!
//! ## Error Hierarchy
//!
//! `ScanError` is an enum that consolidates the scan failure taxonomy:
//!
//! - **`Verification`**: The plan failed its pre-run checks (mismatched
//!   positioner array lengths, targets outside travel limits, empty plan).
//!   A run that fails verification performs zero motion.
//! - **`Hook`**: One or more pre-scan/post-scan/at-break hooks signaled
//!   failure. The remaining hooks of that phase are still collected so the
//!   error reports every failure, then the run aborts.
//! - **`Config`**: Wraps errors from the `config` crate, typically file
//!   parsing or format issues in a settings file.
//! - **`Io`**: Wraps standard `std::io::Error` from sink/file handling.
//! - **`Storage`**: A data sink refused an operation (e.g. writing before
//!   `open`).
//! - **`FeatureNotEnabled`**: Functionality compiled out via feature flags
//!   was requested, with a clear message on how to enable it.
//! - **`Fault`**: Any other error from an instrument or sink call. These
//!   bubble up unmodified; the run ends with `complete() == false` and no
//!   consistency guarantee beyond data already flushed.
//!
//! Note that an external abort is *not* an error: the engine unwinds
//! cooperatively through its post-scan phase and `run()` returns the output
//! path of the partially written file.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Failure taxonomy for a step scan.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Plan rejected before any motion was issued.
    #[error("Scan verification failed: {0}")]
    Verification(String),

    /// One or more lifecycle hooks of a phase signaled failure.
    #[error("{phase} hook failure: {failures:?}")]
    Hook {
        /// Which hook phase failed (`pre_scan`, `post_scan`, `at_break`).
        phase: &'static str,
        /// Collected failure messages, one per failing hook.
        failures: Vec<String>,
    },

    /// Settings file parsing or layering failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// File or path handling failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A data sink refused an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A compiled-out feature was requested.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Uncaught instrument or sink fault, passed through unmodified.
    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

impl ScanError {
    /// Build a `Hook` error from collected per-hook failure messages.
    pub fn hook(phase: &'static str, failures: Vec<String>) -> Self {
        ScanError::Hook { phase, failures }
    }
}
