//! Page-lock tracking and hang diagnosis.
//!
//! Every logical operation that touches page locks gets a [`Tracker`]: a
//! bounded ring buffer of [`LockEvent`]s plus a stack of the locks it
//! currently holds. Trackers live in a [`TrackerRegistry`] that a background
//! [`HangMonitor`] scans for locks held longer than the configured threshold.
//! When one is found (or an operator asks), the tracker is rendered into a
//! [`DumpRecord`] and surfaced through the [`PageLockDiagnostics`] facade.
//!
//! Tracking never fails the page access it observes: unbalanced unlocks
//! only flag the tracker as anomalous, and events that cannot be stored are
//! counted as dropped.
//!
//! ```no_run
//! use pagelock_diag::{DiagnosticsConfig, DiagnosticsService, LockMode, ManagementDirectory, PageId};
//!
//! # async fn run() {
//! let service = DiagnosticsService::start(
//!     "node-1",
//!     DiagnosticsConfig::default(),
//!     ManagementDirectory::platform(),
//!     &tokio::runtime::Handle::current(),
//! );
//!
//! let mut op = service.registry().begin_current_thread().unwrap();
//! op.on_lock(PageId::new(7, 42), LockMode::Write);
//! op.on_unlock(PageId::new(7, 42), LockMode::Write);
//! drop(op);
//!
//! service.stop().await;
//! # }
//! ```

macro_rules! pagelock_warn {
    ($($arg:tt)+) => {
        {
            let msg = format!($($arg)+);
            for (i, line) in msg.lines().enumerate() {
                if i == 0 {
                    ::tracing::warn!(target: "pagelock", "{}", line);
                } else {
                    ::tracing::warn!(target: "pagelock", "pagelock: {}", line);
                }
            }
        }
    };
}

macro_rules! pagelock_error {
    ($($arg:tt)+) => {
        {
            let msg = format!($($arg)+);
            for (i, line) in msg.lines().enumerate() {
                if i == 0 {
                    ::tracing::error!(target: "pagelock", "{}", line);
                } else {
                    ::tracing::error!(target: "pagelock", "pagelock: {}", line);
                }
            }
        }
    };
}

mod callsite;
mod clock;
mod config;
mod dump;
mod error;
mod facade;
mod management;
mod monitor;
mod page;
mod registry;
mod service;
mod stats;
mod thread;
mod tracker;

pub use callsite::{CallSite, CallSiteTable};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{DiagnosticsConfig, Settings};
pub use dump::{DumpRecord, HeldLockLine, WaitingLine};
pub use error::{DiagnosticsError, Result};
pub use facade::PageLockDiagnostics;
pub use management::{
    BeanName, ManagementDirectory, PageLockTrackerBean, Registration, DIAGNOSTIC_GROUP,
    PAGE_LOCK_TRACKER_BEAN,
};
pub use monitor::{HangMonitor, ScanReport};
pub use page::{LockEvent, LockMode, LockOp, PageId};
pub use registry::{OperationId, OperationTracker, TrackerRegistry};
pub use service::DiagnosticsService;
pub use stats::{MetricsSnapshot, Stats};
pub use thread::ThreadTag;
pub use tracker::{HeldLock, Tracker, TrackerSnapshot, WaitingFor};
