//! Node lifecycle wiring.
//!
//! The storage engine starts one [`DiagnosticsService`] per node and hands
//! its registry to the page-memory code. Nothing here is global: the
//! registry, settings and monitor all live as long as the service.

use crate::clock::{Clock, MonotonicClock};
use crate::config::{DiagnosticsConfig, Settings};
use crate::error::Result;
use crate::facade::PageLockDiagnostics;
use crate::management::{BeanName, ManagementDirectory, PageLockTrackerBean, Registration};
use crate::monitor::HangMonitor;
use crate::registry::TrackerRegistry;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

#[derive(Debug)]
pub struct DiagnosticsService {
    bean_name: BeanName,
    diagnostics: Arc<PageLockDiagnostics>,
    directory: Arc<ManagementDirectory>,
    monitor: HangMonitor,
}

impl DiagnosticsService {
    /// Brings diagnostics up for `node`. Never fails: a bad config falls back
    /// to defaults and a failed bean registration only costs the management
    /// interface.
    pub fn start(
        node: &str,
        config: DiagnosticsConfig,
        directory: Arc<ManagementDirectory>,
        runtime: &Handle,
    ) -> Self {
        Self::start_with_clock(
            node,
            config,
            directory,
            runtime,
            Arc::new(MonotonicClock::new()),
        )
    }

    pub fn start_with_clock(
        node: &str,
        config: DiagnosticsConfig,
        directory: Arc<ManagementDirectory>,
        runtime: &Handle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                pagelock_warn!("{}; using default page lock diagnostics config", e);
                DiagnosticsConfig::default()
            }
        };
        let settings = Arc::new(Settings::new(&config));
        let registry = Arc::new(TrackerRegistry::with_clock(settings, clock));
        let diagnostics = Arc::new(PageLockDiagnostics::new(registry.clone()));
        let monitor = HangMonitor::spawn(registry, runtime);

        let service = Self {
            bean_name: BeanName::page_lock_tracker(node),
            diagnostics,
            directory,
            monitor,
        };
        if let Err(e) = service.register_bean() {
            pagelock_warn!("{}; node continues without page lock management", e);
        }
        info!(
            target: "pagelock",
            "page lock diagnostics started for node '{}' (enabled={}, threshold={}ms, scan={}ms)",
            node,
            config.enabled,
            config.hang_threshold_ms,
            config.scan_interval_ms
        );
        service
    }

    /// Registers the management bean. Registering again is a no-op.
    pub fn register_bean(&self) -> Result<Registration> {
        let registration = self
            .directory
            .register(self.bean_name.clone(), self.bean())?;
        if registration == Registration::AlreadyRegistered {
            debug!(target: "pagelock", "bean {} already registered", self.bean_name);
        }
        Ok(registration)
    }

    pub fn registry(&self) -> &Arc<TrackerRegistry> {
        self.diagnostics.registry()
    }

    pub fn diagnostics(&self) -> &Arc<PageLockDiagnostics> {
        &self.diagnostics
    }

    pub fn bean_name(&self) -> &BeanName {
        &self.bean_name
    }

    pub fn monitor(&self) -> &HangMonitor {
        &self.monitor
    }

    fn bean(&self) -> Arc<dyn PageLockTrackerBean> {
        self.diagnostics.clone()
    }

    /// Cancels the monitor after its current scan, drops every tracker and
    /// removes the management bean if this service is the one that
    /// registered it.
    pub async fn stop(self) {
        self.monitor.shutdown().await;
        self.registry().clear();
        self.directory.unregister_if(&self.bean_name, &self.bean());
        info!(
            target: "pagelock",
            "page lock diagnostics stopped for node '{}'",
            self.bean_name.node
        );
    }
}
