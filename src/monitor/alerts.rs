//! Operator alerts.
//!
//! `status/alerts.jsonl` is append-only: every change to an alert (raise,
//! resolve, acknowledge) appends the full record again, and replaying the
//! file keeps the last record per id. A crash mid-append can only lose the
//! line being written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::append_line;
use crate::{flog_debug, flog_warn, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

pub mod kind {
    pub const STUCK_APPROVAL: &str = "stuck_approval";
    pub const STUCK_EDITING: &str = "stuck_editing";
    pub const APPROVAL_REQUIRED: &str = "approval_required";
    pub const INJECTION_FAILED: &str = "injection_failed";
    pub const REPEATEDLY_STUCK: &str = "repeatedly_stuck";
    pub const NO_COMPLETION_SIGNAL: &str = "no_completion_signal";
    pub const ARCHIVE_FAILED: &str = "archive_failed";

    /// Kinds that describe a stuck terminal and go away once the worker is
    /// classified as something else.
    pub const STUCK_KINDS: &[&str] = &[
        STUCK_APPROVAL,
        STUCK_EDITING,
        APPROVAL_REQUIRED,
        INJECTION_FAILED,
        REPEATEDLY_STUCK,
    ];
}

/// Worker id used for alerts about the phase as a whole.
pub const PHASE_SCOPE: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub worker_id: String,
    pub severity: Severity,
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

pub struct AlertLog {
    path: PathBuf,
    alerts: Vec<Alert>,
    by_id: HashMap<String, usize>,
    /// Bytes of the file already replayed.
    synced_len: u64,
}

impl AlertLog {
    /// Open the log, replaying existing records. Unparseable lines are skipped.
    pub fn open(path: &Path) -> Result<Self> {
        let mut log = Self {
            path: path.to_path_buf(),
            alerts: Vec::new(),
            by_id: HashMap::new(),
            synced_len: 0,
        };
        if !path.exists() {
            return Ok(log);
        }

        let content = fs::read_to_string(path)?;
        log.synced_len = content.len() as u64;
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Alert>(line) {
                Ok(alert) => log.upsert(alert),
                Err(e) => flog_warn!("alerts.jsonl line {} skipped: {}", n + 1, e),
            }
        }
        flog_debug!(
            "AlertLog::open replayed {} alerts ({} open)",
            log.alerts.len(),
            log.open_alerts().len()
        );
        Ok(log)
    }

    fn upsert(&mut self, alert: Alert) {
        match self.by_id.get(&alert.id) {
            Some(&i) => self.alerts[i] = alert,
            None => {
                self.by_id.insert(alert.id.clone(), self.alerts.len());
                self.alerts.push(alert);
            }
        }
    }

    /// Replay the file again if another process (`foreman ack`) appended
    /// to it since the last read. Returns true when records were reloaded.
    pub fn refresh(&mut self) -> Result<bool> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if len == self.synced_len {
            return Ok(false);
        }
        flog_debug!("AlertLog::refresh {} -> {} bytes", self.synced_len, len);
        *self = Self::open(&self.path)?;
        Ok(true)
    }

    fn persist(&mut self, alert: Alert) -> Result<Alert> {
        let line = serde_json::to_string(&alert)?;
        append_line(&self.path, &line)?;
        self.synced_len += line.len() as u64 + 1;
        self.upsert(alert.clone());
        Ok(alert)
    }

    /// Raise an alert. An open alert of the same kind for the same worker is
    /// returned as is instead of being duplicated.
    pub fn raise(
        &mut self,
        worker_id: &str,
        severity: Severity,
        kind: &str,
        message: &str,
    ) -> Result<Alert> {
        self.refresh()?;
        if let Some(existing) = self.find_open(worker_id, kind) {
            return Ok(existing.clone());
        }
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let alert = Alert {
            id,
            worker_id: worker_id.to_string(),
            severity,
            kind: kind.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolution: None,
        };
        self.persist(alert)
    }

    fn resolve_at(&mut self, index: usize, resolution: &str) -> Result<Alert> {
        let mut alert = self.alerts[index].clone();
        alert.resolved = true;
        alert.resolved_at = Some(Utc::now());
        alert.resolution = Some(resolution.to_string());
        self.persist(alert)
    }

    /// Explicitly resolve an alert by id (or unique id prefix).
    pub fn acknowledge(&mut self, id: &str) -> Result<Alert> {
        self.refresh()?;
        let matches: Vec<usize> = self
            .alerts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.id == id || (!id.is_empty() && a.id.starts_with(id)))
            .map(|(i, _)| i)
            .collect();
        let index = match matches.as_slice() {
            [i] => *i,
            [] => return Err(Error::State(format!("no alert with id '{}'", id))),
            _ => return Err(Error::State(format!("alert id '{}' is ambiguous", id))),
        };
        if self.alerts[index].resolved {
            return Ok(self.alerts[index].clone());
        }
        self.resolve_at(index, "acknowledged")
    }

    /// Resolve the open alerts of `worker_id` whose kind is in `kinds`.
    pub fn resolve_kinds(
        &mut self,
        worker_id: &str,
        kinds: &[&str],
        resolution: &str,
    ) -> Result<Vec<Alert>> {
        self.refresh()?;
        let indexes: Vec<usize> = self
            .alerts
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.resolved && a.worker_id == worker_id && kinds.contains(&a.kind.as_str()))
            .map(|(i, _)| i)
            .collect();
        indexes
            .into_iter()
            .map(|i| self.resolve_at(i, resolution))
            .collect()
    }

    pub fn find_open(&self, worker_id: &str, kind: &str) -> Option<&Alert> {
        self.alerts
            .iter()
            .find(|a| !a.resolved && a.worker_id == worker_id && a.kind == kind)
    }

    pub fn open_alerts(&self) -> Vec<&Alert> {
        self.alerts.iter().filter(|a| !a.resolved).collect()
    }

    pub fn all(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn get(&self, id: &str) -> Option<&Alert> {
        self.by_id.get(id).map(|&i| &self.alerts[i])
    }
}
