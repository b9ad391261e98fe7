//! One-shot operations against a project directory: status report, manual
//! phase close, alert acknowledgement and stop requests.
//!
//! None of these need the daemon to be running. They read what it persists
//! and evaluate a live completion verdict without writing any phase state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ProjectPaths;
use crate::git::BranchStatus;
use crate::monitor::alerts::Alert;
use crate::monitor::completion::{CompletionDetector, SignalCollector, SignalSource};
use crate::monitor::daemon::MonitorSnapshot;
use crate::monitor::{AlertLog, ArchiveResult, ArchiveTrigger, EventKind, HealthState, PhaseState, Project};
use crate::registry::ConsensusMode;
use crate::util::write_atomic;
use crate::{flog, flog_warn, Result};

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub branch: String,
    pub role: Option<String>,
    pub excluded: bool,
    pub health: HealthState,
    pub rule: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub signals: Vec<SignalSource>,
    pub satisfied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project: String,
    pub phase: u32,
    pub version: String,
    pub mode: ConsensusMode,
    pub started_at: DateTime<Utc>,
    pub complete: bool,
    pub archived: bool,
    pub archive_path: Option<PathBuf>,
    pub archive_escalated: bool,
    pub last_tick: Option<DateTime<Utc>>,
    pub daemon_pid: Option<u32>,
    pub workers: Vec<WorkerStatus>,
    pub open_alerts: Vec<Alert>,
}

/// Saved phase state when it belongs to the configured phase, otherwise a
/// fresh in-memory one. Never writes.
pub fn current_phase_state(project: &Project) -> Result<PhaseState> {
    let version = project.version();
    Ok(PhaseState::load(&project.paths.phase_state_file())?
        .filter(|s| s.phase == project.registry.active_phase() && s.version == version)
        .unwrap_or_else(|| PhaseState::start(&project.registry, &version, None)))
}

impl StatusReport {
    pub fn build(project: &Project, branches: Arc<dyn BranchStatus>) -> Result<Self> {
        let state = current_phase_state(project)?;
        let detector = CompletionDetector::new(
            project.registry.clone(),
            SignalCollector::new(
                project.paths.clone(),
                project.settings.completion_markers.clone(),
                branches,
            ),
        );
        let verdict = detector.evaluate(&state);

        let snapshot = match MonitorSnapshot::load(&project.paths.monitor_state_file()) {
            Ok(s) => s.filter(|s| s.phase == state.phase),
            Err(e) => {
                flog_warn!("Ignoring monitor state: {}", e);
                None
            }
        };

        let workers = project
            .registry
            .workers_in_phase(state.phase)
            .into_iter()
            .map(|w| {
                let seen = snapshot.as_ref().and_then(|s| s.workers.get(&w.id));
                let judged = verdict.per_worker.get(&w.id);
                WorkerStatus {
                    id: w.id.clone(),
                    branch: w.branch.clone(),
                    role: w.role.clone(),
                    excluded: project.registry.is_excluded(w),
                    health: seen.map(|s| s.health).unwrap_or_default(),
                    rule: seen.and_then(|s| s.rule.clone()),
                    last_activity: seen.and_then(|s| s.last_activity),
                    signals: judged
                        .map(|v| v.signals.iter().map(|s| s.source).collect())
                        .unwrap_or_default(),
                    satisfied: judged.is_some_and(|v| v.satisfied),
                }
            })
            .collect();

        let alerts = AlertLog::open(&project.paths.alerts_file())?;

        Ok(Self {
            project: project.config.project.name.clone(),
            phase: state.phase,
            version: state.version.clone(),
            mode: verdict.mode,
            started_at: state.started_at,
            complete: state.complete || verdict.complete,
            archived: state.archived,
            archive_path: state.archive_path.clone(),
            archive_escalated: state.archive_escalated,
            last_tick: snapshot.as_ref().and_then(|s| s.last_tick),
            daemon_pid: snapshot.as_ref().map(|s| s.pid),
            workers,
            open_alerts: alerts.open_alerts().into_iter().cloned().collect(),
        })
    }

    /// `0` when the phase is complete or archived, `1` otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.complete || self.archived {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} - phase {} ({}, {} mode)",
            self.project, self.phase, self.version, self.mode
        );
        let status = match (&self.archive_path, self.archived, self.complete) {
            (Some(path), true, _) => format!("archived -> {}", path.display()),
            (None, true, _) => "archived".to_string(),
            (_, false, true) if self.archive_escalated => "complete, archive failed (needs close-phase)".to_string(),
            (_, false, true) => "complete, not yet archived".to_string(),
            _ => "in progress".to_string(),
        };
        let _ = writeln!(out, "Status:  {}", status);
        let _ = writeln!(out, "Started: {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        match self.last_tick {
            Some(t) => {
                let _ = writeln!(out, "Monitor: last tick {}", t.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            None => {
                let _ = writeln!(out, "Monitor: no ticks recorded");
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "  {:<16} {:<17} {:<38} {}",
            "WORKER", "HEALTH", "SIGNALS", "DONE"
        );
        for w in &self.workers {
            let id = if w.excluded {
                format!("{}*", w.id)
            } else {
                w.id.clone()
            };
            let signals = if w.signals.is_empty() {
                "-".to_string()
            } else {
                w.signals.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")
            };
            let _ = writeln!(
                out,
                "  {:<16} {:<17} {:<38} {}",
                id,
                w.health.as_str(),
                signals,
                if w.satisfied { "yes" } else { "no" }
            );
        }
        if self.workers.iter().any(|w| w.excluded) {
            let _ = writeln!(out, "  * excluded from the completion verdict");
        }

        if !self.open_alerts.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Open alerts:");
            for a in &self.open_alerts {
                let _ = writeln!(
                    out,
                    "  {} [{}] {} {}: {}",
                    a.id, a.severity, a.worker_id, a.kind, a.message
                );
            }
        }
        out
    }
}

/// Archive the active phase now, whatever the verdict says.
pub fn close_phase(project: &Project, branches: Arc<dyn BranchStatus>) -> Result<ArchiveResult> {
    let mut state = current_phase_state(project)?;
    let detector = CompletionDetector::new(
        project.registry.clone(),
        SignalCollector::new(
            project.paths.clone(),
            project.settings.completion_markers.clone(),
            branches,
        ),
    );
    let verdict = detector.evaluate(&state);
    state.latch(
        &verdict
            .per_worker
            .values()
            .flat_map(|v| v.signals.iter().cloned())
            .collect::<Vec<_>>(),
    );
    state.apply_verdict(&verdict);

    let result = project
        .archiver()
        .archive(&mut state, &project.registry, &verdict, ArchiveTrigger::Manual)?;
    let events = project.event_log();
    match &result {
        ArchiveResult::Created(path) => {
            flog!("Phase {} closed manually", state.phase);
            events.record_quietly(
                None,
                EventKind::ArchiveCreated,
                json!({"phase": state.phase, "path": path, "trigger": "manual"}),
            );
        }
        ArchiveResult::AlreadyArchived(path) => {
            events.record_quietly(
                None,
                EventKind::ArchiveSkipped,
                json!({"phase": state.phase, "path": path, "trigger": "manual"}),
            );
        }
    }
    Ok(result)
}

/// Resolve an alert by id or unique id prefix.
pub fn acknowledge(project: &Project, alert_id: &str) -> Result<Alert> {
    let mut alerts = AlertLog::open(&project.paths.alerts_file())?;
    let alert = alerts.acknowledge(alert_id)?;
    project.event_log().record_quietly(
        Some(alert.worker_id.as_str()),
        EventKind::AlertResolved,
        json!({"alert_id": alert.id, "kind": alert.kind, "resolution": "acknowledged"}),
    );
    Ok(alert)
}

/// Ask a running daemon to stop after its current tick.
pub fn request_stop(paths: &ProjectPaths) -> Result<PathBuf> {
    let path = paths.stop_file();
    let body = json!({"requested_at": Utc::now(), "pid": std::process::id()});
    write_atomic(&path, body.to_string().as_bytes())?;
    Ok(path)
}
