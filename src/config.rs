use crate::error::{DiagnosticsError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const DEFAULT_HANG_THRESHOLD_MILLIS: u64 = 60_000;
const DEFAULT_SCAN_INTERVAL_MILLIS: u64 = 5_000;
const DEFAULT_HISTORY_CAPACITY: usize = 128;
const DEFAULT_STACK_CAPACITY: usize = 64;

/// Startup configuration, usually embedded in the node's own config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub hang_threshold_ms: u64,
    pub scan_interval_ms: u64,
    pub dump_dir: Option<PathBuf>,
    /// Events kept per tracker before the oldest are overwritten.
    pub history_capacity: usize,
    /// Locks a single operation may hold at once before pushes are dropped.
    pub stack_capacity: usize,
    /// Capture a backtrace when an operation begins. Costly; off by default.
    pub capture_backtraces: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hang_threshold_ms: DEFAULT_HANG_THRESHOLD_MILLIS,
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MILLIS,
            dump_dir: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            stack_capacity: DEFAULT_STACK_CAPACITY,
            capture_backtraces: false,
        }
    }
}

impl DiagnosticsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hang_threshold_ms == 0 {
            return Err(DiagnosticsError::InvalidConfig(
                "hang_threshold_ms must be positive".to_string(),
            ));
        }
        if self.scan_interval_ms == 0 {
            return Err(DiagnosticsError::InvalidConfig(
                "scan_interval_ms must be positive".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(DiagnosticsError::InvalidConfig(
                "history_capacity must be positive".to_string(),
            ));
        }
        if self.stack_capacity == 0 {
            return Err(DiagnosticsError::InvalidConfig(
                "stack_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Live, runtime-mutable view of the configuration shared by the registry,
/// the monitor and the management facade.
#[derive(Debug)]
pub struct Settings {
    enabled: AtomicBool,
    hang_threshold_ms: AtomicU64,
    scan_interval_ms: AtomicU64,
    dump_dir: RwLock<Option<PathBuf>>,
    history_capacity: usize,
    stack_capacity: usize,
    capture_backtraces: bool,
}

impl Settings {
    pub fn new(config: &DiagnosticsConfig) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            hang_threshold_ms: AtomicU64::new(config.hang_threshold_ms),
            scan_interval_ms: AtomicU64::new(config.scan_interval_ms),
            dump_dir: RwLock::new(config.dump_dir.clone()),
            history_capacity: config.history_capacity,
            stack_capacity: config.stack_capacity,
            capture_backtraces: config.capture_backtraces,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn hang_threshold(&self) -> Duration {
        Duration::from_millis(self.hang_threshold_ms.load(Ordering::Relaxed))
    }

    pub fn set_hang_threshold(&self, threshold: Duration) -> Result<()> {
        let millis = threshold.as_millis() as u64;
        if millis == 0 {
            return Err(DiagnosticsError::InvalidConfig(
                "hang threshold must be at least 1ms".to_string(),
            ));
        }
        self.hang_threshold_ms.store(millis, Ordering::Relaxed);
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_scan_interval(&self, interval: Duration) -> Result<()> {
        let millis = interval.as_millis() as u64;
        if millis == 0 {
            return Err(DiagnosticsError::InvalidConfig(
                "scan interval must be at least 1ms".to_string(),
            ));
        }
        self.scan_interval_ms.store(millis, Ordering::Relaxed);
        Ok(())
    }

    pub fn dump_dir(&self) -> Option<PathBuf> {
        self.dump_dir.read().clone()
    }

    pub fn set_dump_dir(&self, dir: Option<PathBuf>) {
        *self.dump_dir.write() = dir;
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    pub fn stack_capacity(&self) -> usize {
        self.stack_capacity
    }

    pub fn capture_backtraces(&self) -> bool {
        self.capture_backtraces
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(&DiagnosticsConfig::default())
    }
}
