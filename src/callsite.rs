use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};

// Past this many distinct sites new ones resolve as unknown.
const MAX_CALL_SITES: usize = 1 << 16;
const LOCAL_CACHE_LIMIT: usize = 4096;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // (table id, location address) -> interned id
    static LOCAL_IDS: RefCell<HashMap<(u64, usize), u32>> = RefCell::new(HashMap::new());
}

/// Source location of a lock or unlock call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

impl From<&'static Location<'static>> for CallSite {
    fn from(location: &'static Location<'static>) -> Self {
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }
}

/// Interns `#[track_caller]` locations into compact ids so trackers can
/// store them in a single atomic word. Id 0 means unknown.
///
/// Each thread keeps its own cache of ids it has already seen, so a call
/// site that was interned once is resolved without touching shared state.
#[derive(Debug)]
pub struct CallSiteTable {
    table_id: u64,
    ids: DashMap<usize, u32>,
    sites: RwLock<Vec<CallSite>>,
}

impl Default for CallSiteTable {
    fn default() -> Self {
        Self {
            table_id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            ids: DashMap::new(),
            sites: RwLock::new(Vec::new()),
        }
    }
}

impl CallSiteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, location: &'static Location<'static>) -> u32 {
        let key = (self.table_id, location as *const Location<'static> as usize);
        let cached = LOCAL_IDS
            .try_with(|ids| ids.borrow().get(&key).copied())
            .ok()
            .flatten();
        if let Some(id) = cached {
            return id;
        }
        let id = self.intern_shared(key.1, location);
        let _ = LOCAL_IDS.try_with(|ids| {
            let mut ids = ids.borrow_mut();
            if ids.len() >= LOCAL_CACHE_LIMIT {
                ids.clear();
            }
            ids.insert(key, id);
        });
        id
    }

    fn intern_shared(&self, key: usize, location: &'static Location<'static>) -> u32 {
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        *self.ids.entry(key).or_insert_with(|| {
            let mut sites = self.sites.write();
            if sites.len() >= MAX_CALL_SITES {
                return 0;
            }
            sites.push(CallSite::from(location));
            sites.len() as u32
        })
    }

    pub fn resolve(&self, id: u32) -> Option<CallSite> {
        if id == 0 {
            return None;
        }
        self.sites.read().get(id as usize - 1).copied()
    }

    pub fn len(&self) -> usize {
        self.sites.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
