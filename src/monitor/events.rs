//! Append-only event log and human-readable decision log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::append_line;
use crate::{flog_warn, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MonitorStarted,
    MonitorStopped,
    StateChanged,
    CaptureFailed,
    ApprovalSucceeded,
    ApprovalFailed,
    InjectionFailed,
    ApprovalSkipped,
    AlertRaised,
    AlertResolved,
    SignalObserved,
    VerdictChanged,
    ArchiveCreated,
    ArchiveSkipped,
    ArchiveFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub event_kind: EventKind,
    pub detail: serde_json::Value,
}

/// Writers for `monitor-events.jsonl` and `decisions.log`.
///
/// Each call opens the file in append mode and writes one line, so the log
/// handles are cheap to clone and share between worker tasks.
#[derive(Debug, Clone)]
pub struct EventLog {
    events_path: PathBuf,
    decisions_path: PathBuf,
}

impl EventLog {
    pub fn new(events_path: &Path, decisions_path: &Path) -> Self {
        Self {
            events_path: events_path.to_path_buf(),
            decisions_path: decisions_path.to_path_buf(),
        }
    }

    pub fn record(
        &self,
        worker_id: Option<&str>,
        event_kind: EventKind,
        detail: serde_json::Value,
    ) -> Result<()> {
        let record = EventRecord {
            timestamp: Utc::now(),
            worker_id: worker_id.map(str::to_string),
            event_kind,
            detail,
        };
        append_line(&self.events_path, &serde_json::to_string(&record)?)
    }

    /// `[timestamp] worker: text`
    pub fn decision(&self, worker_id: &str, text: &str) -> Result<()> {
        let line = format!(
            "[{}] {}: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            worker_id,
            text
        );
        append_line(&self.decisions_path, &line)
    }

    /// Record an event, logging instead of failing. Used on paths where a
    /// full disk must not take down the tick.
    pub fn record_quietly(&self, worker_id: Option<&str>, event_kind: EventKind, detail: serde_json::Value) {
        if let Err(e) = self.record(worker_id, event_kind, detail) {
            flog_warn!("Failed to append event {:?}: {}", event_kind, e);
        }
    }

    pub fn decision_quietly(&self, worker_id: &str, text: &str) {
        if let Err(e) = self.decision(worker_id, text) {
            flog_warn!("Failed to append decision for {}: {}", worker_id, e);
        }
    }

    /// Parsed events, oldest first. Malformed lines are skipped.
    pub fn read_events(&self) -> Result<Vec<EventRecord>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }
        Ok(fs::read_to_string(&self.events_path)?
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn decisions_path(&self) -> &Path {
        &self.decisions_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn event_log(dir: &TempDir) -> EventLog {
        EventLog::new(
            &dir.path().join("status/monitor-events.jsonl"),
            &dir.path().join("status/decisions.log"),
        )
    }

    #[test]
    fn test_record_appends_structured_lines() {
        let dir = TempDir::new().unwrap();
        let log = event_log(&dir);
        log.record(Some("w1"), EventKind::ApprovalSucceeded, json!({"keys": ["1", "Enter"]}))
            .unwrap();
        log.record(None, EventKind::VerdictChanged, json!({"complete": true}))
            .unwrap();

        let events = log.read_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].worker_id.as_deref(), Some("w1"));
        assert_eq!(events[0].event_kind, EventKind::ApprovalSucceeded);
        assert_eq!(events[1].detail["complete"], true);

        let raw = fs::read_to_string(log.events_path()).unwrap();
        assert!(raw.contains("\"event_kind\":\"approval_succeeded\""));
    }

    #[test]
    fn test_decision_line_format() {
        let dir = TempDir::new().unwrap();
        let log = event_log(&dir);
        log.decision("w2", "state=stuck_approval, action=select option 1, outcome=resolved")
            .unwrap();
        let content = fs::read_to_string(log.decisions_path()).unwrap();
        assert!(content.starts_with('['));
        assert!(content.trim_end().ends_with("w2: state=stuck_approval, action=select option 1, outcome=resolved"));
    }

    #[test]
    fn test_read_events_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(event_log(&dir).read_events().unwrap().is_empty());
    }
}
