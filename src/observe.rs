//! Injected trace observer
//!
//! The surrounding library routes error, SQL and file-operation traces
//! through process-wide hooks. Here the observer is an explicit interface
//! passed into the database at open time: no global mutable state, and
//! backup / retrieve stay independently testable.
//!
//! All methods have empty defaults so an observer only implements what it
//! cares about.

use std::path::Path;
use std::sync::Mutex;

/// Observer for file operations and repair lifecycle events
pub trait TraceObserver: Send + Sync {
    /// A file-system operation performed by the subsystem (copy, rename, remove)
    fn file_operation(&self, _op: &str, _path: &Path) {}

    /// A repair lifecycle event (backup written, phase entered, table skipped)
    fn repair_event(&self, _event: &str, _detail: &str) {}

    /// A non-fatal error swallowed by a best-effort path
    fn error(&self, _context: &str, _message: &str) {}
}

/// Observer that drops every event
pub struct NoopObserver;

impl TraceObserver for NoopObserver {}

/// Observer that records events in memory, for tests and diagnostics
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, oldest first
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, line: String) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(line);
    }
}

impl TraceObserver for RecordingObserver {
    fn file_operation(&self, op: &str, path: &Path) {
        self.push(format!("file:{}:{}", op, path.display()));
    }

    fn repair_event(&self, event: &str, detail: &str) {
        self.push(format!("event:{}:{}", event, detail));
    }

    fn error(&self, context: &str, message: &str) {
        self.push(format!("error:{}:{}", context, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_recording_observer_captures_in_order() {
        let obs = RecordingObserver::new();
        obs.repair_event("backup", "started");
        obs.file_operation("rename", &PathBuf::from("/tmp/x"));
        obs.error("scheduler", "backup failed");

        let events = obs.events();
        assert_eq!(events.len(), 3);
        assert!(events[0].starts_with("event:backup"));
        assert!(events[1].starts_with("file:rename"));
        assert!(events[2].starts_with("error:scheduler"));
    }

    #[test]
    fn test_noop_observer_accepts_everything() {
        let obs = NoopObserver;
        obs.repair_event("retrieve", "phase");
        obs.error("x", "y");
    }
}
