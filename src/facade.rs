//! Operator-facing entry point: on-demand dumps and runtime configuration.
//!
//! Every call here reads trackers through snapshots, so it is safe to use
//! from any thread while page locks are being taken.

use crate::dump::{persist_dump, render_all, DumpRecord};
use crate::error::{DiagnosticsError, Result};
use crate::management::PageLockTrackerBean;
use crate::registry::{OperationId, TrackerRegistry};
use crate::stats::MetricsSnapshot;
use crate::tracker::Tracker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PageLockDiagnostics {
    registry: Arc<TrackerRegistry>,
}

impl PageLockDiagnostics {
    pub fn new(registry: Arc<TrackerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TrackerRegistry> {
        &self.registry
    }

    pub fn dump_all_records(&self) -> Vec<DumpRecord> {
        capture(&self.registry.trackers())
    }

    /// Dumps every tracked operation, persisting the text when a dump
    /// location is configured.
    pub fn dump_all(&self) -> String {
        let text = render_all(&self.dump_all_records());
        self.persist_best_effort("all", &text);
        text
    }

    pub fn dump_operation(&self, id: &OperationId) -> Result<String> {
        let tracker = self
            .registry
            .get(id)
            .ok_or_else(|| DiagnosticsError::NotFound(format!("operation '{}'", id)))?;
        let text = DumpRecord::capture(&tracker.snapshot()).render();
        self.persist_best_effort(id.as_str(), &text);
        Ok(text)
    }

    pub fn dump_thread(&self, thread_id: u64) -> Result<String> {
        let trackers = self.registry.trackers_for_thread(thread_id);
        if trackers.is_empty() {
            return Err(DiagnosticsError::NotFound(format!("thread {}", thread_id)));
        }
        let text = render_all(&capture(&trackers));
        self.persist_best_effort(&format!("thread-{}", thread_id), &text);
        Ok(text)
    }

    /// Dumps every tracked operation into the dump location, failing if
    /// none is configured or the file cannot be written.
    pub fn write_dump(&self) -> Result<PathBuf> {
        let text = render_all(&self.dump_all_records());
        persist_dump(&self.registry, "all", &text)?.ok_or_else(|| {
            DiagnosticsError::DumpWrite("no dump location configured".to_string())
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.registry.settings().enabled()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.registry.settings().set_enabled(enabled);
        info!(target: "pagelock", "page lock tracking enabled={}", enabled);
    }

    pub fn threshold(&self) -> Duration {
        self.registry.settings().hang_threshold()
    }

    pub fn set_threshold(&self, threshold: Duration) -> Result<()> {
        self.registry.settings().set_hang_threshold(threshold)
    }

    pub fn scan_interval(&self) -> Duration {
        self.registry.settings().scan_interval()
    }

    pub fn set_scan_interval(&self, interval: Duration) -> Result<()> {
        self.registry.settings().set_scan_interval(interval)
    }

    pub fn dump_output_location(&self) -> Option<PathBuf> {
        self.registry.settings().dump_dir()
    }

    pub fn set_dump_output_location(&self, path: Option<PathBuf>) {
        self.registry.settings().set_dump_dir(path);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.registry.metrics()
    }

    fn persist_best_effort(&self, label: &str, text: &str) {
        if let Err(e) = persist_dump(&self.registry, label, text) {
            pagelock_warn!("{}", e);
        }
    }
}

fn capture(trackers: &[Arc<Tracker>]) -> Vec<DumpRecord> {
    trackers
        .iter()
        .map(|tracker| DumpRecord::capture(&tracker.snapshot()))
        .collect()
}

impl PageLockTrackerBean for PageLockDiagnostics {
    fn dump_locked_pages(&self) -> Result<String> {
        Ok(self.dump_all())
    }

    fn dump_locked_pages_for_thread(&self, thread_id: u64) -> Result<String> {
        self.dump_thread(thread_id)
    }

    fn is_enabled(&self) -> bool {
        PageLockDiagnostics::is_enabled(self)
    }

    fn set_enabled(&self, enabled: bool) {
        PageLockDiagnostics::set_enabled(self, enabled)
    }

    fn get_threshold(&self) -> u64 {
        self.threshold().as_millis() as u64
    }

    fn set_threshold(&self, millis: u64) -> Result<()> {
        PageLockDiagnostics::set_threshold(self, Duration::from_millis(millis))
    }

    fn get_dump_path(&self) -> Option<PathBuf> {
        self.dump_output_location()
    }

    fn set_dump_path(&self, path: Option<PathBuf>) {
        self.set_dump_output_location(path)
    }
}
