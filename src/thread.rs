use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a thread that owns trackers.
///
/// `std::thread::ThreadId` has no stable numeric form, so threads are
/// numbered on first use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ThreadTag {
    pub id: u64,
    pub name: Arc<str>,
}

impl ThreadTag {
    /// Tag of the calling thread.
    pub fn current() -> Self {
        current().0
    }
}

impl fmt::Display for ThreadTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Shared "is the owning thread still running" flag.
#[derive(Debug, Clone)]
pub(crate) struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub(crate) fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn dead() -> Self {
        Liveness(Arc::new(AtomicBool::new(false)))
    }
}

// Marks the thread dead when thread-local storage is torn down.
struct ThreadSentinel {
    tag: ThreadTag,
    alive: Liveness,
}

impl ThreadSentinel {
    fn new() -> Self {
        let current = std::thread::current();
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = match current.name() {
            Some(name) => Arc::from(name),
            None => Arc::from(format!("thread-{}", id)),
        };
        Self {
            tag: ThreadTag { id, name },
            alive: Liveness(Arc::new(AtomicBool::new(true))),
        }
    }
}

impl Drop for ThreadSentinel {
    fn drop(&mut self) {
        self.alive.0.store(false, Ordering::Release);
    }
}

thread_local! {
    static SENTINEL: ThreadSentinel = ThreadSentinel::new();
}

pub(crate) fn current() -> (ThreadTag, Liveness) {
    SENTINEL
        .try_with(|s| (s.tag.clone(), s.alive.clone()))
        .unwrap_or_else(|_| {
            // Thread is already tearing down its locals.
            let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            let tag = ThreadTag {
                id,
                name: Arc::from("<exiting>"),
            };
            (tag, Liveness::dead())
        })
}
