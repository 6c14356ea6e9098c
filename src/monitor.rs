//! Background hang detection.
//!
//! One task per registry wakes every scan interval, looks at the oldest lock
//! each tracker holds and dumps the tracker once that lock has been held
//! longer than the hang threshold. Detection is observational only: the
//! blocked operation is never interrupted.

use crate::dump::{persist_dump, DumpRecord};
use crate::registry::TrackerRegistry;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Outcome of one scan cycle.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub scanned: usize,
    pub evicted: usize,
    pub hangs: Vec<DumpRecord>,
}

#[derive(Debug)]
pub struct HangMonitor {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HangMonitor {
    /// Starts the periodic scan on `runtime`.
    pub fn spawn(registry: Arc<TrackerRegistry>, runtime: &Handle) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(async move {
            debug!(target: "pagelock", "hang monitor started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                // Re-read each cycle so interval changes apply without restart.
                let interval = registry.settings().scan_interval();
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        // Dumps may hit the disk; keep that off the runtime workers.
                        let scanned = registry.clone();
                        let report = match tokio::task::spawn_blocking(move || Self::scan(&scanned)).await {
                            Ok(report) => report,
                            Err(e) => {
                                pagelock_warn!("hang monitor scan failed: {}", e);
                                continue;
                            }
                        };
                        if !report.hangs.is_empty() || report.evicted > 0 {
                            debug!(
                                target: "pagelock",
                                "scan: {} trackers, {} hangs, {} evicted",
                                report.scanned,
                                report.hangs.len(),
                                report.evicted
                            );
                        }
                    }
                }
            }
            debug!(target: "pagelock", "hang monitor stopped");
        });
        Self {
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Runs one scan cycle synchronously.
    pub fn scan(registry: &TrackerRegistry) -> ScanReport {
        let mut report = ScanReport::default();
        let settings = registry.settings();
        if !settings.enabled() {
            return report;
        }
        let threshold = settings.hang_threshold().as_millis() as u64;

        registry.for_each(|tracker| {
            report.scanned += 1;
            if !tracker.owner_alive() {
                if registry.evict(tracker) {
                    report.evicted += 1;
                }
                return;
            }
            let Some(oldest) = tracker.oldest_held() else {
                return;
            };
            let held_for = tracker.now().saturating_sub(oldest.acquired_at);
            if held_for <= threshold || !tracker.mark_reported(oldest.seq) {
                return;
            }

            let record = DumpRecord::capture(&tracker.snapshot());
            let text = record.render();
            pagelock_error!(
                "Possible page lock hang: {} page={} held for {}ms by thread {} (threshold {}ms)\n{}",
                oldest.mode,
                oldest.page,
                held_for,
                tracker.thread(),
                threshold,
                text
            );
            registry
                .stats()
                .hangs_reported
                .fetch_add(1, Ordering::Relaxed);
            match persist_dump(registry, &tracker.thread().name, &text) {
                Ok(Some(path)) => {
                    info!(target: "pagelock", "hang dump written to {}", path.display())
                }
                Ok(None) => {}
                Err(e) => pagelock_warn!("{}", e),
            }
            report.hangs.push(record);
        });
        report
    }

    /// Stops the task. A scan already running finishes first; no new scan
    /// starts afterwards.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                pagelock_warn!("hang monitor task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for HangMonitor {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
