//! Process-wide map from operation identity to its live tracker.

use crate::callsite::CallSiteTable;
use crate::clock::{Clock, MonotonicClock};
use crate::config::Settings;
use crate::error::{DiagnosticsError, Result};
use crate::page::{LockMode, LockOp, PageId};
use crate::stats::{MetricsSnapshot, Stats};
use crate::thread::ThreadTag;
use crate::tracker::Tracker;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Unique handle of one logical unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OperationId(Arc<str>);

impl OperationId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        OperationId(id.into())
    }

    /// Identity derived from the calling thread, for callers that run one
    /// operation per thread at a time.
    pub fn for_current_thread() -> Self {
        let tag = ThreadTag::current();
        OperationId(Arc::from(format!("thread-{}", tag.id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(id: &str) -> Self {
        OperationId(Arc::from(id))
    }
}

impl From<String> for OperationId {
    fn from(id: String) -> Self {
        OperationId(Arc::from(id))
    }
}

pub struct TrackerRegistry {
    trackers: DashMap<OperationId, Arc<Tracker>>,
    settings: Arc<Settings>,
    clock: Arc<dyn Clock>,
    sites: Arc<CallSiteTable>,
    stats: Arc<Stats>,
}

impl fmt::Debug for TrackerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerRegistry")
            .field("trackers", &self.trackers.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl TrackerRegistry {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self::with_clock(settings, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(settings: Arc<Settings>, clock: Arc<dyn Clock>) -> Self {
        Self {
            trackers: DashMap::new(),
            settings,
            clock,
            sites: Arc::new(CallSiteTable::new()),
            stats: Arc::new(Stats::default()),
        }
    }

    /// Starts tracking `id` on the calling thread.
    ///
    /// While diagnostics are disabled the returned handle is detached: it
    /// records nothing and nothing is registered.
    pub fn begin(self: &Arc<Self>, id: impl Into<OperationId>) -> Result<OperationTracker> {
        let id = id.into();
        if !self.settings.enabled() {
            return Ok(OperationTracker::detached());
        }
        match self.trackers.entry(id.clone()) {
            Entry::Occupied(_) => Err(DiagnosticsError::AlreadyTracked(id)),
            Entry::Vacant(vacant) => {
                let tracker = Arc::new(Tracker::new(
                    id,
                    &self.settings,
                    self.clock.clone(),
                    self.sites.clone(),
                    self.stats.clone(),
                ));
                vacant.insert(tracker.clone());
                Ok(OperationTracker {
                    inner: Some((tracker, self.clone())),
                    _owner_thread: PhantomData,
                })
            }
        }
    }

    pub fn begin_current_thread(self: &Arc<Self>) -> Result<OperationTracker> {
        self.begin(OperationId::for_current_thread())
    }

    /// Stops tracking `id`. Does nothing if it is not tracked.
    pub fn end(&self, id: &OperationId) {
        self.trackers.remove(id);
    }

    pub fn get(&self, id: &OperationId) -> Option<Arc<Tracker>> {
        self.trackers.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.trackers.contains_key(id)
    }

    /// Copies the current set of trackers. Shard locks are released before
    /// the copy is returned.
    pub fn trackers(&self) -> Vec<Arc<Tracker>> {
        let mut trackers: Vec<_> = self
            .trackers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        trackers.sort_by(|a, b| a.operation().cmp(b.operation()));
        trackers
    }

    /// Visits a copy of the current trackers, so the visitor may freely
    /// begin or end operations.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<Tracker>)) {
        for tracker in self.trackers() {
            visitor(&tracker);
        }
    }

    pub fn trackers_for_thread(&self, thread_id: u64) -> Vec<Arc<Tracker>> {
        self.trackers()
            .into_iter()
            .filter(|tracker| tracker.thread().id == thread_id)
            .collect()
    }

    /// Removes `tracker` if it is still the registered one for its id.
    pub(crate) fn evict(&self, tracker: &Arc<Tracker>) -> bool {
        let removed = self
            .trackers
            .remove_if(tracker.operation(), |_, current| Arc::ptr_eq(current, tracker))
            .is_some();
        if removed {
            self.stats.evicted_trackers.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "pagelock",
                "evicted tracker for '{}' (thread {} is gone)",
                tracker.operation(),
                tracker.thread()
            );
        }
        removed
    }

    pub fn clear(&self) {
        self.trackers.clear();
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let trackers = self.trackers();
        let anomalous = trackers.iter().filter(|t| t.is_anomalous()).count();
        MetricsSnapshot::collect(&self.stats, trackers.len() as u64, anomalous as u64)
    }
}

/// Owner-side handle of a tracker. Page-access code reports its lock
/// transitions here; dropping the handle ends the operation.
///
/// The handle is neither `Send` nor `Sync`: only the thread that began the
/// operation may write to its tracker.
pub struct OperationTracker {
    inner: Option<(Arc<Tracker>, Arc<TrackerRegistry>)>,
    _owner_thread: PhantomData<*const ()>,
}

impl fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTracker")
            .field("tracker", &self.inner.as_ref().map(|(t, _)| t))
            .finish()
    }
}

impl OperationTracker {
    /// A handle that tracks nothing.
    pub fn detached() -> Self {
        Self {
            inner: None,
            _owner_thread: PhantomData,
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.inner.is_some()
    }

    pub fn operation(&self) -> Option<&OperationId> {
        self.tracker().map(|t| t.operation())
    }

    pub fn tracker(&self) -> Option<&Arc<Tracker>> {
        self.inner.as_ref().map(|(tracker, _)| tracker)
    }

    /// The owner is about to block on `page`.
    #[track_caller]
    pub fn before_lock(&mut self, page: PageId, mode: LockMode) {
        let caller = Location::caller();
        if let Some((tracker, _)) = &self.inner {
            tracker.set_waiting(page, mode, tracker.intern_site(caller));
        }
    }

    /// The owner gave up waiting without taking the lock.
    pub fn cancel_wait(&mut self) {
        if let Some((tracker, _)) = &self.inner {
            tracker.clear_waiting();
        }
    }

    #[track_caller]
    pub fn on_lock(&mut self, page: PageId, mode: LockMode) {
        self.record_at(LockOp::Lock, mode, page, Location::caller());
    }

    #[track_caller]
    pub fn on_unlock(&mut self, page: PageId, mode: LockMode) {
        self.record_at(LockOp::Unlock, mode, page, Location::caller());
    }

    #[track_caller]
    pub fn record(&mut self, op: LockOp, mode: LockMode, page: PageId) {
        self.record_at(op, mode, page, Location::caller());
    }

    fn record_at(
        &mut self,
        op: LockOp,
        mode: LockMode,
        page: PageId,
        caller: &'static Location<'static>,
    ) {
        if let Some((tracker, _)) = &self.inner {
            tracker.record(op, mode, page, tracker.intern_site(caller));
        }
    }
}

impl Drop for OperationTracker {
    fn drop(&mut self) {
        if let Some((tracker, registry)) = self.inner.take() {
            registry
                .trackers
                .remove_if(tracker.operation(), |_, current| {
                    Arc::ptr_eq(current, &tracker)
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiagnosticsConfig;

    fn registry() -> Arc<TrackerRegistry> {
        Arc::new(TrackerRegistry::new(Arc::new(Settings::default())))
    }

    #[test]
    fn begin_twice_is_already_tracked() {
        let registry = registry();
        let _op = registry.begin("op1").unwrap();
        let err = registry.begin("op1").unwrap_err();
        assert!(matches!(err, DiagnosticsError::AlreadyTracked(id) if id.as_str() == "op1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn end_is_a_no_op_for_unknown_ids() {
        let registry = registry();
        registry.end(&OperationId::from("missing"));
        assert!(registry.is_empty());
    }

    #[test]
    fn dropping_the_handle_ends_the_operation() {
        let registry = registry();
        {
            let _op = registry.begin("op1").unwrap();
            assert!(registry.contains(&OperationId::from("op1")));
        }
        assert!(!registry.contains(&OperationId::from("op1")));
    }

    #[test]
    fn stale_handle_does_not_remove_a_newer_tracker() {
        let registry = registry();
        let old = registry.begin("op1").unwrap();
        registry.end(&OperationId::from("op1"));
        let _new = registry.begin("op1").unwrap();
        drop(old);
        assert!(registry.contains(&OperationId::from("op1")));
    }

    #[test]
    fn handle_records_with_call_sites() {
        let registry = registry();
        let mut op = registry.begin("op1").unwrap();
        op.on_lock(PageId::new(1, 1), LockMode::Write);

        let snapshot = op.tracker().unwrap().snapshot();
        let site = snapshot.held[0].site.unwrap();
        assert!(site.file.ends_with("registry.rs"));
        assert_eq!(registry.stats().events_recorded(), 1);
    }

    #[test]
    fn disabled_registry_hands_out_detached_handles() {
        let settings = Arc::new(Settings::new(&DiagnosticsConfig {
            enabled: false,
            ..Default::default()
        }));
        let registry = Arc::new(TrackerRegistry::new(settings));
        let mut op = registry.begin("op1").unwrap();
        op.on_lock(PageId::new(1, 1), LockMode::Read);
        assert!(!op.is_tracked());
        assert!(registry.is_empty());
        assert_eq!(registry.stats().events_recorded(), 0);
    }

    #[test]
    fn for_each_tolerates_mutation() {
        let registry = registry();
        let _a = registry.begin("a").unwrap();
        let _b = registry.begin("b").unwrap();
        let mut seen = Vec::new();
        registry.for_each(|tracker| {
            seen.push(tracker.operation().to_string());
            registry.end(tracker.operation());
        });
        assert_eq!(seen, vec!["a", "b"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn trackers_are_found_by_thread() {
        let registry = registry();
        let _op = registry.begin_current_thread().unwrap();
        let me = ThreadTag::current().id;
        assert_eq!(registry.trackers_for_thread(me).len(), 1);
        assert!(registry.trackers_for_thread(u64::MAX).is_empty());
    }

    #[test]
    fn metrics_count_anomalous_trackers() {
        let registry = registry();
        let mut op = registry.begin("op1").unwrap();
        op.on_unlock(PageId::new(1, 1), LockMode::Read);
        let _clean = registry.begin("op2").unwrap();

        let metrics = registry.metrics();
        assert_eq!(metrics.get("page_lock_tracker.active_trackers"), Some(2));
        assert_eq!(metrics.get("page_lock_tracker.anomalous_trackers"), Some(1));
    }
}
