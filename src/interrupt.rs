//! Abort/pause/resume flags and status publishing.
//!
//! Every component observes and reports interrupt state through one
//! [`InterruptSource`] rather than ambient global state. External callers
//! request an abort or pause by setting a flag; the engine observes the
//! flags cooperatively at its fixed suspension points, never via exceptions
//! or preemption.
//!
//! When a remote [`StatusStore`] is injected it is authoritative for the
//! flags and receives every status string (plus a heartbeat timestamp), so
//! an external supervisor can both steer and observe a scan without
//! touching the engine. Without a store, state lives in local atomics.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Remote key/value store for interrupt flags, status strings and live
/// scan data. Implementations are external collaborators; [`MemoryStore`]
/// backs tests and store-less deployments that still want introspection.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Set a status key to a string value.
    async fn set_info(&self, key: &str, value: &str) -> Result<()>;

    /// Read a status key as a boolean (absent keys are false).
    async fn get_info_bool(&self, key: &str) -> Result<bool>;

    /// Publish a named data column.
    async fn set_scandata(&self, key: &str, values: &[f64]) -> Result<()>;

    /// Drop all published data columns.
    async fn clear_scandata(&self) -> Result<()>;
}

/// Snapshot of the interrupt flags at one suspension point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interrupts {
    /// Unwind the run through the post-scan phase.
    pub abort: bool,
    /// Hold at the current point.
    pub pause: bool,
    /// Leave the paused state.
    pub resume: bool,
}

const KEY_ABORT: &str = "request_abort";
const KEY_PAUSE: &str = "request_pause";
const KEY_RESUME: &str = "request_resume";

/// Cooperative interrupt flags plus the status channel.
///
/// The local atomics always mirror the last observed state; the injected
/// store, when present, is the authority consulted by [`InterruptSource::check`].
pub struct InterruptSource {
    abort: AtomicBool,
    pause: AtomicBool,
    resume: AtomicBool,
    store: Option<Arc<dyn StatusStore>>,
    info: Mutex<HashMap<String, String>>,
}

impl InterruptSource {
    /// Interrupt state held purely in local atomics.
    pub fn local() -> Self {
        Self {
            abort: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            resume: AtomicBool::new(false),
            store: None,
            info: Mutex::new(HashMap::new()),
        }
    }

    /// Interrupt state backed by an authoritative remote store.
    pub fn with_store(store: Arc<dyn StatusStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::local()
        }
    }

    /// Whether a remote store is configured.
    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Request a cooperative abort. Observed at the next suspension point.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Request a pause at the current point.
    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Request that a paused scan resume.
    pub fn request_resume(&self) {
        self.resume.store(true, Ordering::SeqCst);
    }

    /// Read the current flags, consulting the store when configured. The
    /// local atomics are updated to the observed state.
    pub async fn check(&self) -> Result<Interrupts> {
        if let Some(store) = &self.store {
            // Store flags are ORed with locally requested ones so a local
            // request_abort() still works under a store-backed deployment.
            let abort = store.get_info_bool(KEY_ABORT).await? || self.abort.load(Ordering::SeqCst);
            let pause = store.get_info_bool(KEY_PAUSE).await? || self.pause.load(Ordering::SeqCst);
            let resume =
                store.get_info_bool(KEY_RESUME).await? || self.resume.load(Ordering::SeqCst);
            self.abort.store(abort, Ordering::SeqCst);
            self.pause.store(pause, Ordering::SeqCst);
            self.resume.store(resume, Ordering::SeqCst);
            Ok(Interrupts {
                abort,
                pause,
                resume,
            })
        } else {
            Ok(Interrupts {
                abort: self.abort.load(Ordering::SeqCst),
                pause: self.pause.load(Ordering::SeqCst),
                resume: self.resume.load(Ordering::SeqCst),
            })
        }
    }

    /// Reset all flags, locally and in the store.
    pub async fn clear(&self) -> Result<()> {
        self.abort.store(false, Ordering::SeqCst);
        self.pause.store(false, Ordering::SeqCst);
        self.resume.store(false, Ordering::SeqCst);
        if let Some(store) = &self.store {
            store.set_info(KEY_ABORT, "0").await?;
            store.set_info(KEY_PAUSE, "0").await?;
            store.set_info(KEY_RESUME, "0").await?;
        }
        Ok(())
    }

    /// Reset the pause/resume pair after a scan leaves the paused state.
    /// Abort is left untouched.
    pub async fn clear_pause(&self) -> Result<()> {
        self.pause.store(false, Ordering::SeqCst);
        self.resume.store(false, Ordering::SeqCst);
        if let Some(store) = &self.store {
            store.set_info(KEY_PAUSE, "0").await?;
            store.set_info(KEY_RESUME, "0").await?;
        }
        Ok(())
    }

    /// Publish a status string. Mirrored to the store with a heartbeat
    /// timestamp when one is configured.
    pub async fn set_info(&self, key: &str, value: &str) -> Result<()> {
        if let Ok(mut info) = self.info.lock() {
            info.insert(key.to_string(), value.to_string());
        }
        if let Some(store) = &self.store {
            store.set_info(key, value).await?;
            store
                .set_info("heartbeat", &chrono::Utc::now().to_rfc3339())
                .await?;
        }
        Ok(())
    }

    /// Publish the last error message.
    pub async fn set_error(&self, msg: &str) -> Result<()> {
        self.set_info("last_error", msg).await
    }

    /// Last locally recorded value for a status key.
    pub fn info(&self, key: &str) -> Option<String> {
        self.info.lock().ok().and_then(|m| m.get(key).cloned())
    }

    /// Publish a data column to the store, if one is configured.
    pub async fn set_scandata(&self, key: &str, values: &[f64]) -> Result<()> {
        if let Some(store) = &self.store {
            store.set_scandata(key, values).await?;
        }
        Ok(())
    }

    /// Drop all store-side data columns, if a store is configured.
    pub async fn clear_scandata(&self) -> Result<()> {
        if let Some(store) = &self.store {
            store.clear_scandata().await?;
        }
        Ok(())
    }
}

/// Map a label to a store-safe variable name: non-alphanumeric characters
/// become `_`, names starting with a digit get a leading `_`.
pub fn fix_varname(label: &str) -> String {
    let mut out: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Sanitize a list of labels into unique variable names; the second
/// occurrence of a name gets a `_2` suffix, the third `_3`, and so on.
pub fn unique_varnames<S: AsRef<str>>(labels: &[S]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    labels
        .iter()
        .map(|label| {
            let base = fix_varname(label.as_ref());
            let n = seen.entry(base.clone()).or_insert(0);
            *n += 1;
            if *n == 1 {
                base
            } else {
                format!("{}_{}", base, n)
            }
        })
        .collect()
}

/// In-memory [`StatusStore`] used by tests and local deployments.
#[derive(Default)]
pub struct MemoryStore {
    info: RwLock<HashMap<String, String>>,
    scandata: RwLock<HashMap<String, Vec<f64>>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a status key.
    pub async fn info(&self, key: &str) -> Option<String> {
        self.info.read().await.get(key).cloned()
    }

    /// Current contents of a published data column.
    pub async fn scandata(&self, key: &str) -> Option<Vec<f64>> {
        self.scandata.read().await.get(key).cloned()
    }

    /// Names of all published data columns.
    pub async fn scandata_keys(&self) -> Vec<String> {
        self.scandata.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn set_info(&self, key: &str, value: &str) -> Result<()> {
        self.info
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_info_bool(&self, key: &str) -> Result<bool> {
        Ok(self
            .info
            .read()
            .await
            .get(key)
            .map(|v| !matches!(v.as_str(), "" | "0" | "false"))
            .unwrap_or(false))
    }

    async fn set_scandata(&self, key: &str, values: &[f64]) -> Result<()> {
        self.scandata
            .write()
            .await
            .insert(key.to_string(), values.to_vec());
        Ok(())
    }

    async fn clear_scandata(&self) -> Result<()> {
        self.scandata.write().await.clear();
        Ok(())
    }
}
