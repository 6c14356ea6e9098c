//! Rendering tracker snapshots for operators.
//!
//! A dump is plain text: a header line, one line per held lock, the
//! chronological event history and finally the stack trace. Rendering never
//! fails as a whole; a field that cannot be formatted is replaced by an
//! explicit `<format error>` marker.

use crate::callsite::CallSite;
use crate::error::{DiagnosticsError, Result};
use crate::page::{LockEvent, LockMode, PageId};
use crate::registry::{OperationId, TrackerRegistry};
use crate::thread::ThreadTag;
use crate::tracker::TrackerSnapshot;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const FORMAT_ERROR: &str = "<format error>";

static DUMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldLockLine {
    pub page: PageId,
    pub mode: LockMode,
    pub age_ms: u64,
    pub site: Option<CallSite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitingLine {
    pub page: PageId,
    pub mode: LockMode,
    pub waited_ms: u64,
    pub site: Option<CallSite>,
}

/// Everything an operator needs to understand one operation's page locks.
#[derive(Debug, Clone, Serialize)]
pub struct DumpRecord {
    pub operation: OperationId,
    pub thread: ThreadTag,
    pub captured_at: DateTime<Utc>,
    pub truncated: bool,
    pub anomalous: bool,
    pub dropped_events: u64,
    pub total_events: u64,
    pub held: Vec<HeldLockLine>,
    pub untracked_held: usize,
    pub waiting: Option<WaitingLine>,
    pub events: Vec<LockEvent>,
    /// Innermost frame first.
    pub stack_trace: Vec<String>,
}

impl DumpRecord {
    pub fn capture(snapshot: &TrackerSnapshot) -> Self {
        let now = snapshot.taken_at;
        let held: Vec<HeldLockLine> = snapshot
            .held
            .iter()
            .map(|lock| HeldLockLine {
                page: lock.page,
                mode: lock.mode,
                age_ms: now.saturating_sub(lock.acquired_at),
                site: lock.site,
            })
            .collect();
        let waiting = snapshot.waiting.as_ref().map(|waiting| WaitingLine {
            page: waiting.page,
            mode: waiting.mode,
            waited_ms: now.saturating_sub(waiting.since),
            site: waiting.site,
        });

        let mut stack_trace = Vec::new();
        if let Some(waiting) = &waiting {
            stack_trace.push(site_frame(waiting.site, "wait", waiting.mode, waiting.page));
        }
        for lock in held.iter().rev() {
            stack_trace.push(site_frame(lock.site, "lock", lock.mode, lock.page));
        }
        if let Some(backtrace) = &snapshot.backtrace {
            stack_trace.push("operation started at:".to_string());
            stack_trace.extend(backtrace.lines().map(|line| line.trim_end().to_string()));
        }

        Self {
            operation: snapshot.operation.clone(),
            thread: snapshot.thread.clone(),
            captured_at: Utc::now(),
            truncated: snapshot.truncated(),
            anomalous: snapshot.anomalous,
            dropped_events: snapshot.dropped_events,
            total_events: snapshot.total_events,
            held,
            untracked_held: snapshot.untracked_held,
            waiting,
            events: snapshot.events.clone(),
            stack_trace,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        push_line(
            &mut out,
            format_args!(
                "Page locks dump: thread={} operation={} captured={} truncated={} anomalous={} dropped={}",
                Field(&self.thread),
                Field(&self.operation),
                self.captured_at.to_rfc3339(),
                self.truncated,
                self.anomalous,
                self.dropped_events
            ),
        );

        if let Some(waiting) = &self.waiting {
            push_line(
                &mut out,
                format_args!(
                    "Waiting: {} page={} for {}ms",
                    waiting.mode,
                    Field(waiting.page),
                    waiting.waited_ms
                ),
            );
        }

        push_line(&mut out, format_args!("Locked pages ({}):", self.held.len()));
        for lock in &self.held {
            push_line(
                &mut out,
                format_args!(
                    "  LOCK {} page={} age={}ms",
                    lock.mode,
                    Field(lock.page),
                    lock.age_ms
                ),
            );
        }
        if self.untracked_held > 0 {
            push_line(
                &mut out,
                format_args!("  (+{} locks beyond stack capacity)", self.untracked_held),
            );
        }

        if self.truncated {
            push_line(
                &mut out,
                format_args!(
                    "Events (last {} of {}, truncated):",
                    self.events.len(),
                    self.total_events
                ),
            );
        } else {
            push_line(&mut out, format_args!("Events ({}):", self.events.len()));
        }
        for event in &self.events {
            push_line(&mut out, format_args!("  {}", Field(event)));
        }

        push_line(&mut out, format_args!("Stack trace:"));
        if self.stack_trace.is_empty() {
            push_line(&mut out, format_args!("  <no frames captured>"));
        }
        for frame in &self.stack_trace {
            push_line(&mut out, format_args!("  {}", frame));
        }
        out
    }
}

fn site_frame(site: Option<CallSite>, what: &str, mode: LockMode, page: PageId) -> String {
    match site {
        Some(site) => format!("at {} ({} {} page={})", site, what, mode, page),
        None => format!("at <unknown site> ({} {} page={})", what, mode, page),
    }
}

/// Displays the wrapped value, or the error marker if its `Display` fails,
/// so one bad field does not cost the rest of the line.
struct Field<T>(T);

impl<T: fmt::Display> fmt::Display for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = String::new();
        if write!(buf, "{}", self.0).is_ok() {
            f.write_str(&buf)
        } else {
            f.write_str(FORMAT_ERROR)
        }
    }
}

fn push_line(out: &mut String, args: fmt::Arguments<'_>) {
    let mark = out.len();
    if out.write_fmt(args).is_err() {
        out.truncate(mark);
        out.push_str(FORMAT_ERROR);
    }
    out.push('\n');
}

/// Renders several records as one dump, separated by blank lines.
pub(crate) fn render_all(records: &[DumpRecord]) -> String {
    if records.is_empty() {
        return "Page locks dump: no tracked operations\n".to_string();
    }
    records
        .iter()
        .map(DumpRecord::render)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Writes one dump into `dir`, creating it if needed. Returns the file path.
pub(crate) fn write_dump_file(dir: &Path, label: &str, text: &str) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create dump directory '{}'", dir.display()))?;

    let label: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let file_name = format!(
        "page_locks_{}_{}_{}.txt",
        label,
        Utc::now().format("%Y%m%d_%H%M%S%3f"),
        DUMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let path = dir.join(file_name);
    fs::write(&path, text)
        .with_context(|| format!("failed to write dump file '{}'", path.display()))?;
    Ok(path)
}

/// Persists `text` into the configured dump directory, if any.
pub(crate) fn persist_dump(
    registry: &TrackerRegistry,
    label: &str,
    text: &str,
) -> Result<Option<PathBuf>> {
    let Some(dir) = registry.settings().dump_dir() else {
        return Ok(None);
    };
    let path = write_dump_file(&dir, label, text)
        .map_err(|e| DiagnosticsError::DumpWrite(format!("{:#}", e)))?;
    registry
        .stats()
        .dumps_written
        .fetch_add(1, Ordering::Relaxed);
    Ok(Some(path))
}
