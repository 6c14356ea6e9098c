//! Per-operation lock history.
//!
//! A [`Tracker`] is written by exactly one thread, its owner, through an
//! [`crate::OperationTracker`]. Everyone else (the hang monitor, on-demand
//! dumps) reads it through [`Tracker::snapshot`], which never blocks the
//! owner.
//!
//! Every slot is a small seqlock: the owner bumps the slot stamp to an odd
//! value, writes the fields, then publishes an even stamp with release
//! ordering. A reader accepts a slot only if it sees the same even stamp
//! before and after copying the fields, so an event is either fully visible
//! or not visible at all.

use crate::callsite::{CallSite, CallSiteTable};
use crate::clock::Clock;
use crate::config::Settings;
use crate::page::{LockEvent, LockMode, LockOp, PageId};
use crate::registry::OperationId;
use crate::stats::Stats;
use crate::thread::{self, Liveness, ThreadTag};
use serde::Serialize;
use std::backtrace::Backtrace;
use std::panic::Location;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const ENTRY_PRESENT: u64 = 1 << 2;

/// Ring buffer slot. Stamp is 0 when empty, `2 * seq - 1` while the event
/// with sequence `seq` is being written and `2 * seq` once it is published.
#[derive(Debug, Default)]
struct EventSlot {
    stamp: AtomicU64,
    meta: AtomicU64,
    structure_id: AtomicU64,
    page_no: AtomicU64,
    timestamp: AtomicU64,
}

impl EventSlot {
    fn write(&self, event: &LockEvent) {
        self.stamp.store(2 * event.seq - 1, Ordering::Relaxed);
        fence(Ordering::Release);
        self.meta.store(
            LockEvent::pack_meta(event.op, event.mode, event.site),
            Ordering::Relaxed,
        );
        self.structure_id
            .store(event.page.structure_id as u64, Ordering::Relaxed);
        self.page_no.store(event.page.page_no, Ordering::Relaxed);
        self.timestamp.store(event.timestamp, Ordering::Relaxed);
        self.stamp.store(2 * event.seq, Ordering::Release);
    }

    fn read(&self, seq: u64) -> Option<LockEvent> {
        let before = self.stamp.load(Ordering::Acquire);
        if before != 2 * seq {
            return None;
        }
        let meta = self.meta.load(Ordering::Relaxed);
        let structure_id = self.structure_id.load(Ordering::Relaxed);
        let page_no = self.page_no.load(Ordering::Relaxed);
        let timestamp = self.timestamp.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if self.stamp.load(Ordering::Relaxed) != before {
            return None;
        }
        let (op, mode, site) = LockEvent::unpack_meta(meta);
        Some(LockEvent {
            op,
            mode,
            page: PageId::new(structure_id as u32, page_no),
            timestamp,
            seq,
            site,
        })
    }
}

/// Page of a lock taken past the stack capacity. Only the owner touches
/// these, so relaxed ordering is enough.
#[derive(Debug, Default)]
struct OverflowSlot {
    structure_id: AtomicU64,
    page_no: AtomicU64,
}

impl OverflowSlot {
    fn write(&self, page: PageId) {
        self.structure_id
            .store(page.structure_id as u64, Ordering::Relaxed);
        self.page_no.store(page.page_no, Ordering::Relaxed);
    }

    fn read(&self) -> PageId {
        PageId::new(
            self.structure_id.load(Ordering::Relaxed) as u32,
            self.page_no.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    page: PageId,
    mode: LockMode,
    since: u64,
    seq: u64,
    site: u32,
}

/// Held-lock stack slot (and the waiting-for slot). The stamp is a version
/// counter: odd while the owner rewrites it.
#[derive(Debug, Default)]
struct EntrySlot {
    stamp: AtomicU64,
    meta: AtomicU64,
    structure_id: AtomicU64,
    page_no: AtomicU64,
    since: AtomicU64,
    seq: AtomicU64,
}

impl EntrySlot {
    fn write(&self, entry: Option<Entry>) {
        let version = self.stamp.load(Ordering::Relaxed);
        self.stamp.store(version.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        match entry {
            Some(entry) => {
                let meta = LockEvent::pack_meta(LockOp::Lock, entry.mode, entry.site);
                self.meta.store(meta | ENTRY_PRESENT, Ordering::Relaxed);
                self.structure_id
                    .store(entry.page.structure_id as u64, Ordering::Relaxed);
                self.page_no.store(entry.page.page_no, Ordering::Relaxed);
                self.since.store(entry.since, Ordering::Relaxed);
                self.seq.store(entry.seq, Ordering::Relaxed);
            }
            None => self.meta.store(0, Ordering::Relaxed),
        }
        self.stamp.store(version.wrapping_add(2), Ordering::Release);
    }

    fn read(&self) -> Option<Entry> {
        let before = self.stamp.load(Ordering::Acquire);
        if before % 2 == 1 {
            return None;
        }
        let meta = self.meta.load(Ordering::Relaxed);
        let structure_id = self.structure_id.load(Ordering::Relaxed);
        let page_no = self.page_no.load(Ordering::Relaxed);
        let since = self.since.load(Ordering::Relaxed);
        let seq = self.seq.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if self.stamp.load(Ordering::Relaxed) != before || meta & ENTRY_PRESENT == 0 {
            return None;
        }
        let (_, mode, site) = LockEvent::unpack_meta(meta & !ENTRY_PRESENT);
        Some(Entry {
            page: PageId::new(structure_id as u32, page_no),
            mode,
            since,
            seq,
            site,
        })
    }
}

/// A lock the operation currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldLock {
    pub page: PageId,
    pub mode: LockMode,
    /// Clock reading when the lock was taken.
    pub acquired_at: u64,
    /// Sequence number of the `Lock` event that took it.
    pub seq: u64,
    pub site: Option<CallSite>,
}

/// A lock the operation is blocked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitingFor {
    pub page: PageId,
    pub mode: LockMode,
    pub since: u64,
    pub site: Option<CallSite>,
}

/// Immutable copy of a tracker, possibly a little behind its owner.
#[derive(Debug, Clone)]
pub struct TrackerSnapshot {
    pub operation: OperationId,
    pub thread: ThreadTag,
    /// Chronological, at most `capacity` entries.
    pub events: Vec<LockEvent>,
    /// Acquisition order, oldest first.
    pub held: Vec<HeldLock>,
    /// Locks acquired past the stack capacity and therefore not listed.
    pub untracked_held: usize,
    pub waiting: Option<WaitingFor>,
    pub total_events: u64,
    pub capacity: usize,
    pub anomalous: bool,
    pub dropped_events: u64,
    pub created_at: u64,
    pub taken_at: u64,
    pub backtrace: Option<String>,
}

impl TrackerSnapshot {
    /// History has wrapped and older events are gone.
    pub fn truncated(&self) -> bool {
        self.total_events > self.capacity as u64
    }
}

pub struct Tracker {
    operation: OperationId,
    thread: ThreadTag,
    liveness: Liveness,
    created_at: u64,
    events: Box<[EventSlot]>,
    total: AtomicU64,
    stack: Box<[EntrySlot]>,
    depth: AtomicUsize,
    overflow: AtomicUsize,
    overflow_pages: Box<[OverflowSlot]>,
    waiting: EntrySlot,
    anomalous: AtomicBool,
    dropped: AtomicU64,
    reported_hold: AtomicU64,
    backtrace: Option<Backtrace>,
    clock: Arc<dyn Clock>,
    sites: Arc<CallSiteTable>,
    stats: Arc<Stats>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("operation", &self.operation)
            .field("thread", &self.thread)
            .field("total", &self.total.load(Ordering::Relaxed))
            .field("depth", &self.depth.load(Ordering::Relaxed))
            .field("anomalous", &self.anomalous.load(Ordering::Relaxed))
            .finish()
    }
}

impl Tracker {
    /// Creates a tracker owned by the calling thread.
    pub(crate) fn new(
        operation: OperationId,
        settings: &Settings,
        clock: Arc<dyn Clock>,
        sites: Arc<CallSiteTable>,
        stats: Arc<Stats>,
    ) -> Self {
        let (thread, liveness) = thread::current();
        let backtrace = settings
            .capture_backtraces()
            .then(Backtrace::force_capture);
        Self {
            operation,
            thread,
            liveness,
            created_at: clock.now_millis(),
            events: (0..settings.history_capacity().max(1))
                .map(|_| EventSlot::default())
                .collect(),
            total: AtomicU64::new(0),
            stack: (0..settings.stack_capacity().max(1))
                .map(|_| EntrySlot::default())
                .collect(),
            depth: AtomicUsize::new(0),
            overflow: AtomicUsize::new(0),
            overflow_pages: (0..settings.stack_capacity().max(1))
                .map(|_| OverflowSlot::default())
                .collect(),
            waiting: EntrySlot::default(),
            anomalous: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            reported_hold: AtomicU64::new(0),
            backtrace,
            clock,
            sites,
            stats,
        }
    }

    pub fn operation(&self) -> &OperationId {
        &self.operation
    }

    pub fn thread(&self) -> &ThreadTag {
        &self.thread
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn total_events(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn held_count(&self) -> usize {
        self.depth.load(Ordering::Acquire) + self.overflow.load(Ordering::Relaxed)
    }

    pub fn is_anomalous(&self) -> bool {
        self.anomalous.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn owner_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    pub(crate) fn intern_site(&self, location: &'static Location<'static>) -> u32 {
        self.sites.intern(location)
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Appends one event and updates the held-lock stack. Owner only.
    pub(crate) fn record(&self, op: LockOp, mode: LockMode, page: PageId, site: u32) {
        let seq = self.total.load(Ordering::Relaxed) + 1;
        let event = LockEvent {
            op,
            mode,
            page,
            timestamp: self.clock.now_millis(),
            seq,
            site,
        };

        let slot = ((seq - 1) % self.events.len() as u64) as usize;
        self.events[slot].write(&event);
        self.total.store(seq, Ordering::Release);
        self.stats.events_recorded.fetch_add(1, Ordering::Relaxed);

        match op {
            LockOp::Lock => self.push_held(&event),
            LockOp::Unlock => self.pop_held(&event),
        }
    }

    pub(crate) fn set_waiting(&self, page: PageId, mode: LockMode, site: u32) {
        self.waiting.write(Some(Entry {
            page,
            mode,
            since: self.clock.now_millis(),
            seq: 0,
            site,
        }));
    }

    pub(crate) fn clear_waiting(&self) {
        self.waiting.write(None);
    }

    fn push_held(&self, event: &LockEvent) {
        if self.waiting.read().is_some() {
            self.clear_waiting();
        }
        let depth = self.depth.load(Ordering::Relaxed);
        let overflow = self.overflow.load(Ordering::Relaxed);
        if depth >= self.stack.len() || overflow > 0 {
            if let Some(slot) = self.overflow_pages.get(overflow) {
                slot.write(event.page);
            }
            self.overflow.store(overflow + 1, Ordering::Relaxed);
            self.drop_event();
            return;
        }
        self.stack[depth].write(Some(Entry {
            page: event.page,
            mode: event.mode,
            since: event.timestamp,
            seq: event.seq,
            site: event.site,
        }));
        self.depth.store(depth + 1, Ordering::Release);
    }

    fn pop_held(&self, event: &LockEvent) {
        let overflow = self.overflow.load(Ordering::Relaxed);
        if overflow > 0 {
            // The most recent lock was never pushed. Past the overflow
            // pages its page is unknown and the unlock is taken on trust.
            let matches = self
                .overflow_pages
                .get(overflow - 1)
                .map(|slot| slot.read() == event.page)
                .unwrap_or(true);
            if matches {
                self.overflow.store(overflow - 1, Ordering::Relaxed);
            } else {
                self.anomalous.store(true, Ordering::Relaxed);
            }
            return;
        }
        let depth = self.depth.load(Ordering::Relaxed);
        let top_matches = depth > 0
            && self.stack[depth - 1]
                .read()
                .map(|top| top.page == event.page)
                .unwrap_or(false);
        if top_matches {
            self.depth.store(depth - 1, Ordering::Release);
        } else {
            self.anomalous.store(true, Ordering::Relaxed);
        }
    }

    fn drop_event(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    /// The bottom of the held-lock stack: the lock held the longest.
    pub(crate) fn oldest_held(&self) -> Option<HeldLock> {
        if self.depth.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.stack[0].read().map(|entry| self.held_lock(entry))
    }

    /// Records that the hold starting at `seq` has been reported. Returns
    /// false if it already was.
    pub(crate) fn mark_reported(&self, seq: u64) -> bool {
        self.reported_hold.swap(seq, Ordering::AcqRel) != seq
    }

    fn held_lock(&self, entry: Entry) -> HeldLock {
        HeldLock {
            page: entry.page,
            mode: entry.mode,
            acquired_at: entry.since,
            seq: entry.seq,
            site: self.sites.resolve(entry.site),
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let total = self.total.load(Ordering::Acquire);
        let capacity = self.events.len() as u64;
        let first = if total > capacity {
            total - capacity + 1
        } else {
            1
        };
        let events = (first..=total)
            .filter_map(|seq| self.events[((seq - 1) % capacity) as usize].read(seq))
            .collect();

        let depth = self.depth.load(Ordering::Acquire).min(self.stack.len());
        let held = self.stack[..depth]
            .iter()
            .filter_map(EntrySlot::read)
            .map(|entry| self.held_lock(entry))
            .collect();

        let waiting = self.waiting.read().map(|entry| WaitingFor {
            page: entry.page,
            mode: entry.mode,
            since: entry.since,
            site: self.sites.resolve(entry.site),
        });

        TrackerSnapshot {
            operation: self.operation.clone(),
            thread: self.thread.clone(),
            events,
            held,
            untracked_held: self.overflow.load(Ordering::Relaxed),
            waiting,
            total_events: total,
            capacity: self.events.len(),
            anomalous: self.is_anomalous(),
            dropped_events: self.dropped_events(),
            created_at: self.created_at,
            taken_at: self.clock.now_millis(),
            backtrace: self.backtrace.as_ref().map(|bt| bt.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DiagnosticsConfig;
    use std::time::Duration;

    fn tracker_with(history: usize, stack: usize) -> (Tracker, Arc<ManualClock>, Arc<Stats>) {
        let settings = Settings::new(&DiagnosticsConfig {
            history_capacity: history,
            stack_capacity: stack,
            ..Default::default()
        });
        let clock = Arc::new(ManualClock::new(0));
        let stats = Arc::new(Stats::default());
        let tracker = Tracker::new(
            OperationId::from("op"),
            &settings,
            clock.clone(),
            Arc::new(CallSiteTable::new()),
            stats.clone(),
        );
        (tracker, clock, stats)
    }

    fn page(n: u64) -> PageId {
        PageId::new(1, n)
    }

    fn held_pages(snapshot: &TrackerSnapshot) -> Vec<u64> {
        snapshot.held.iter().map(|h| h.page.page_no).collect()
    }

    #[test]
    fn wrapped_history_keeps_the_last_events() {
        let (tracker, _, _) = tracker_with(4, 16);
        let (a, b, c, d, e) = (page(1), page(2), page(3), page(4), page(5));
        tracker.record(LockOp::Lock, LockMode::Read, a, 0);
        tracker.record(LockOp::Lock, LockMode::Read, b, 0);
        tracker.record(LockOp::Unlock, LockMode::Read, b, 0);
        tracker.record(LockOp::Lock, LockMode::Write, c, 0);
        tracker.record(LockOp::Lock, LockMode::Write, d, 0);
        tracker.record(LockOp::Lock, LockMode::Write, e, 0);

        let snapshot = tracker.snapshot();
        let kept: Vec<_> = snapshot
            .events
            .iter()
            .map(|ev| (ev.op, ev.page.page_no))
            .collect();
        assert_eq!(
            kept,
            vec![
                (LockOp::Unlock, 2),
                (LockOp::Lock, 3),
                (LockOp::Lock, 4),
                (LockOp::Lock, 5)
            ]
        );
        assert_eq!(held_pages(&snapshot), vec![1, 3, 4, 5]);
        assert!(snapshot.truncated());
        assert_eq!(snapshot.total_events, 6);
        assert!(!snapshot.anomalous);
    }

    #[test]
    fn history_is_exactly_the_tail_for_any_length() {
        for capacity in [1, 3, 8] {
            for n in 0..20u64 {
                let (tracker, _, _) = tracker_with(capacity, 32);
                for i in 0..n {
                    tracker.record(LockOp::Lock, LockMode::Read, page(i), 0);
                    tracker.record(LockOp::Unlock, LockMode::Read, page(i), 0);
                }
                let snapshot = tracker.snapshot();
                let expected_len = (2 * n as usize).min(capacity);
                assert_eq!(snapshot.events.len(), expected_len);
                let seqs: Vec<u64> = snapshot.events.iter().map(|ev| ev.seq).collect();
                let expected: Vec<u64> = (2 * n - expected_len as u64 + 1..=2 * n).collect();
                assert_eq!(seqs, expected);
                assert!(snapshot.held.is_empty());
            }
        }
    }

    #[test]
    fn balanced_nesting_leaves_nothing_held() {
        let (tracker, _, _) = tracker_with(8, 8);
        for n in 1..=5 {
            tracker.record(LockOp::Lock, LockMode::Write, page(n), 0);
        }
        for n in (1..=5).rev() {
            tracker.record(LockOp::Unlock, LockMode::Write, page(n), 0);
        }
        assert_eq!(tracker.held_count(), 0);
        assert!(tracker.snapshot().held.is_empty());
        assert!(!tracker.is_anomalous());
    }

    #[test]
    fn unlock_on_empty_stack_is_anomalous() {
        let (tracker, _, _) = tracker_with(8, 8);
        tracker.record(LockOp::Unlock, LockMode::Read, page(9), 0);

        let snapshot = tracker.snapshot();
        assert!(snapshot.anomalous);
        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(snapshot.events[0].op, LockOp::Unlock);

        tracker.record(LockOp::Lock, LockMode::Read, page(1), 0);
        tracker.record(LockOp::Unlock, LockMode::Read, page(1), 0);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.events.len(), 3);
        assert!(snapshot.held.is_empty());
    }

    #[test]
    fn out_of_order_unlock_keeps_the_stack() {
        let (tracker, _, _) = tracker_with(8, 8);
        tracker.record(LockOp::Lock, LockMode::Read, page(1), 0);
        tracker.record(LockOp::Lock, LockMode::Read, page(2), 0);
        tracker.record(LockOp::Unlock, LockMode::Read, page(1), 0);

        let snapshot = tracker.snapshot();
        assert!(snapshot.anomalous);
        assert_eq!(held_pages(&snapshot), vec![1, 2]);
    }

    #[test]
    fn stack_overflow_drops_and_recovers() {
        let (tracker, _, stats) = tracker_with(16, 2);
        for n in 1..=4 {
            tracker.record(LockOp::Lock, LockMode::Read, page(n), 0);
        }
        let snapshot = tracker.snapshot();
        assert_eq!(held_pages(&snapshot), vec![1, 2]);
        assert_eq!(snapshot.untracked_held, 2);
        assert_eq!(snapshot.dropped_events, 2);
        assert_eq!(stats.dropped_events(), 2);
        assert_eq!(snapshot.events.len(), 4);

        for n in (1..=4).rev() {
            tracker.record(LockOp::Unlock, LockMode::Read, page(n), 0);
        }
        assert_eq!(tracker.held_count(), 0);
        assert!(!tracker.is_anomalous());
    }

    #[test]
    fn mismatched_unlock_past_the_stack_is_anomalous() {
        let (tracker, _, _) = tracker_with(16, 2);
        for n in 1..=3 {
            tracker.record(LockOp::Lock, LockMode::Read, page(n), 0);
        }
        tracker.record(LockOp::Unlock, LockMode::Read, page(1), 0);

        let snapshot = tracker.snapshot();
        assert!(snapshot.anomalous);
        assert_eq!(held_pages(&snapshot), vec![1, 2]);
        assert_eq!(snapshot.untracked_held, 1);
        assert_eq!(tracker.held_count(), 3);

        tracker.record(LockOp::Unlock, LockMode::Read, page(3), 0);
        assert_eq!(tracker.snapshot().untracked_held, 0);
        assert_eq!(tracker.held_count(), 2);
    }

    #[test]
    fn timestamps_come_from_the_clock() {
        let (tracker, clock, _) = tracker_with(8, 8);
        clock.set(100);
        tracker.record(LockOp::Lock, LockMode::Write, page(1), 0);
        clock.advance(Duration::from_millis(1500));

        let oldest = tracker.oldest_held().unwrap();
        assert_eq!(oldest.acquired_at, 100);
        assert_eq!(oldest.seq, 1);
        assert_eq!(tracker.now() - oldest.acquired_at, 1500);
    }

    #[test]
    fn waiting_is_cleared_by_the_lock() {
        let (tracker, _, _) = tracker_with(8, 8);
        tracker.set_waiting(page(7), LockMode::Write, 0);
        let waiting = tracker.snapshot().waiting.unwrap();
        assert_eq!(waiting.page, page(7));
        assert_eq!(waiting.mode, LockMode::Write);

        tracker.record(LockOp::Lock, LockMode::Write, page(7), 0);
        assert!(tracker.snapshot().waiting.is_none());
    }

    #[test]
    fn hold_is_reported_once() {
        let (tracker, _, _) = tracker_with(8, 8);
        assert!(tracker.mark_reported(1));
        assert!(!tracker.mark_reported(1));
        assert!(tracker.mark_reported(5));
    }

    #[test]
    fn concurrent_snapshots_never_see_torn_events() {
        let (tracker, _, _) = tracker_with(8, 8);
        let tracker = Arc::new(tracker);
        let reader = {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let snapshot = tracker.snapshot();
                    for pair in snapshot.events.windows(2) {
                        assert!(pair[0].seq < pair[1].seq);
                    }
                    for event in &snapshot.events {
                        // Every event writes page_no == seq.
                        assert_eq!(event.page.page_no, event.seq);
                    }
                }
            })
        };
        for seq in 1..=20_000u64 {
            let op = if seq % 2 == 1 {
                LockOp::Lock
            } else {
                LockOp::Unlock
            };
            tracker.record(op, LockMode::Read, PageId::new(1, seq), 0);
        }
        reader.join().unwrap();
    }
}
