use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

const METRIC_PREFIX: &str = "page_lock_tracker";

/// Aggregate counters shared by every tracker of a registry.
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) events_recorded: AtomicU64,
    pub(crate) dropped_events: AtomicU64,
    pub(crate) hangs_reported: AtomicU64,
    pub(crate) dumps_written: AtomicU64,
    pub(crate) evicted_trackers: AtomicU64,
}

impl Stats {
    pub fn events_recorded(&self) -> u64 {
        self.events_recorded.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn hangs_reported(&self) -> u64 {
        self.hangs_reported.load(Ordering::Relaxed)
    }

    pub fn dumps_written(&self) -> u64 {
        self.dumps_written.load(Ordering::Relaxed)
    }

    pub fn evicted_trackers(&self) -> u64 {
        self.evicted_trackers.load(Ordering::Relaxed)
    }
}

/// Read-only name/value view for metric exporters. Names are stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    values: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub(crate) fn collect(stats: &Stats, active_trackers: u64, anomalous_trackers: u64) -> Self {
        let mut values = BTreeMap::new();
        let mut put = |name: &str, value: u64| {
            values.insert(format!("{}.{}", METRIC_PREFIX, name), value);
        };
        put("active_trackers", active_trackers);
        put("anomalous_trackers", anomalous_trackers);
        put("events_recorded", stats.events_recorded());
        put("dropped_events", stats.dropped_events());
        put("hangs_reported", stats.hangs_reported());
        put("dumps_written", stats.dumps_written());
        put("evicted_trackers", stats.evicted_trackers());
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Only the metrics whose names start with `prefix`.
    pub fn filtered(&self, prefix: &str) -> Self {
        Self {
            values: self
                .values
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(name, value)| (name.clone(), *value))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
