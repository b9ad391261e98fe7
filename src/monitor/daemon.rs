//! The monitoring loop.
//!
//! Two cadences share one `select!` loop: the health tick (capture, classify,
//! approve) and the slower completion check (gather signals, apply the
//! verdict, archive). Per-worker work inside a tick runs concurrently and is
//! isolated: a capture that fails or hangs degrades that worker to
//! `unknown` and the rest of the tick carries on.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::activity::ActivityTracker;
use super::alerts::{kind, AlertLog, Severity, PHASE_SCOPE};
use super::approval::{ApprovalEngine, ApprovalSettings, Resolution};
use super::archive::{ArchiveResult, ArchiveTrigger, Archiver};
use super::classifier::{Classification, Classifier, HealthState};
use super::completion::{CompletionDetector, PhaseVerdict, SignalCollector};
use super::events::{EventKind, EventLog};
use super::phase::PhaseState;
use super::Project;
use crate::config::{MonitorSettings, ProjectPaths};
use crate::git::BranchStatus;
use crate::registry::Registry;
use crate::session::SessionBackend;
use crate::util::{blocking, blocking_with_timeout, hash_string, write_json_atomic};
use crate::{flog, flog_debug, flog_error, flog_warn, Error, Result};

/// What the loop knows about one worker between ticks.
#[derive(Debug, Clone, Default)]
pub struct WorkerHealth {
    /// Only ever assigned from classifier output.
    pub classification: Classification,
    pub last_activity: Option<DateTime<Utc>>,
    pub stuck_streak: u32,
    last_hash: Option<u64>,
    /// `last_activity` came from a previous run and no capture has been seen yet.
    resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub health: HealthState,
    #[serde(default)]
    pub rule: Option<String>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stuck_streak: u32,
}

/// `status/monitor-state.json`, rewritten after every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub pid: u32,
    pub phase: u32,
    pub last_tick: Option<DateTime<Utc>>,
    pub workers: BTreeMap<String, WorkerSnapshot>,
}

impl MonitorSnapshot {
    pub fn load(path: &std::path::Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let snapshot = serde_json::from_str(&fs::read_to_string(path)?)
            .map_err(|e| Error::State(format!("unreadable {}: {}", path.display(), e)))?;
        Ok(Some(snapshot))
    }
}

pub struct MonitorContext {
    paths: ProjectPaths,
    settings: MonitorSettings,
    registry: Arc<Registry>,
    sessions: Arc<dyn SessionBackend>,
    classifier: Arc<Classifier>,
    approvals: Arc<ApprovalEngine>,
    detector: CompletionDetector,
    archiver: Archiver,
    alerts: Arc<Mutex<AlertLog>>,
    events: EventLog,
    activity: ActivityTracker,
    phase: PhaseState,
    health: BTreeMap<String, WorkerHealth>,
    last_tick: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

fn elapsed_since(now: DateTime<Utc>, then: Option<DateTime<Utc>>) -> Duration {
    then.and_then(|t| (now - t).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Await `fut`; once `cancel` fires, give it at most `grace` more.
async fn within_grace<F>(cancel: &CancellationToken, grace: Duration, fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::pin!(fut);
    tokio::select! {
        res = &mut fut => res,
        _ = cancel.cancelled() => match tokio::time::timeout(grace, &mut fut).await {
            Ok(res) => res,
            Err(_) => {
                flog_warn!("Abandoning in-flight check after {:?} grace", grace);
                Ok(())
            }
        },
    }
}

impl MonitorContext {
    pub fn new(
        project: &Project,
        sessions: Arc<dyn SessionBackend>,
        branches: Arc<dyn BranchStatus>,
        phase: PhaseState,
    ) -> Result<Self> {
        let paths = project.paths.clone();
        let settings = project.settings.clone();
        let registry = project.registry.clone();

        let classifier = Arc::new(Classifier::new(
            &settings.completion_markers,
            settings.prompt_window_lines,
            settings.idle_threshold(),
        )?);
        let alerts = Arc::new(Mutex::new(AlertLog::open(&paths.alerts_file())?));
        let events = project.event_log();
        let approvals = Arc::new(ApprovalEngine::new(
            sessions.clone(),
            classifier.clone(),
            alerts.clone(),
            events.clone(),
            ApprovalSettings {
                auto_approve: settings.auto_approve,
                cooldown: settings.approval_cooldown(),
                verify_delay: settings.verify_delay(),
                check_timeout: settings.check_timeout(),
                capture_lines: settings.capture_lines,
            },
        ));
        let detector = CompletionDetector::new(
            registry.clone(),
            SignalCollector::new(paths.clone(), settings.completion_markers.clone(), branches),
        );

        let worker_ids: HashSet<String> = registry
            .workers_in_phase(phase.phase)
            .into_iter()
            .map(|w| w.id.clone())
            .collect();
        let mut health: BTreeMap<String, WorkerHealth> = worker_ids
            .iter()
            .map(|id| (id.clone(), WorkerHealth::default()))
            .collect();

        match MonitorSnapshot::load(&paths.monitor_state_file()) {
            Ok(Some(saved)) if saved.phase == phase.phase => {
                for (id, worker) in saved.workers {
                    if let Some(h) = health.get_mut(&id) {
                        h.last_activity = worker.last_activity;
                        h.resumed = worker.last_activity.is_some();
                    }
                }
                flog_debug!("Restored activity from previous run (last tick {:?})", saved.last_tick);
            }
            Ok(_) => {}
            Err(e) => flog_warn!("Ignoring monitor state: {}", e),
        }

        let stop_file = paths.stop_file();
        if stop_file.exists() {
            flog_warn!("Removing stale stop request {}", stop_file.display());
            fs::remove_file(&stop_file)?;
        }

        Ok(Self {
            activity: ActivityTracker::polling(paths.clone(), worker_ids),
            archiver: project.archiver(),
            paths,
            settings,
            registry,
            sessions,
            classifier,
            approvals,
            detector,
            alerts,
            events,
            phase,
            health,
            last_tick: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Switch activity tracking from polling to a `logs/` watcher.
    pub fn watch_logs(&mut self) {
        let ids = self.health.keys().cloned().collect();
        self.activity = ActivityTracker::watch(self.paths.clone(), ids);
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase_state(&self) -> &PhaseState {
        &self.phase
    }

    pub fn worker_health(&self, worker_id: &str) -> Option<&WorkerHealth> {
        self.health.get(worker_id)
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        self.last_tick
    }

    pub fn alerts(&self) -> Arc<Mutex<AlertLog>> {
        self.alerts.clone()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// One health pass over the active phase.
    pub async fn tick(&mut self) -> Result<()> {
        let stop_file = self.paths.stop_file();
        if stop_file.exists() {
            flog!("Stop requested via {}", stop_file.display());
            fs::remove_file(&stop_file)?;
            self.cancel.cancel();
            return Ok(());
        }

        let now = Utc::now();
        self.activity.poll();
        if let Err(e) = self.alerts.lock().await.refresh() {
            flog_warn!("Failed to reload alerts: {}", e);
        }

        let ids: Vec<String> = self
            .health
            .iter()
            .filter(|(_, h)| h.classification.state() != HealthState::Complete)
            .map(|(id, _)| id.clone())
            .collect();

        let lines = self.settings.capture_lines;
        let deadline = self.settings.check_timeout();
        let captures = join_all(ids.into_iter().map(|id| {
            let sessions = self.sessions.clone();
            let cancel = self.cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return (id, None);
                }
                let worker = id.clone();
                let snapshot =
                    blocking_with_timeout(deadline, move || sessions.capture(&worker, lines)).await;
                (id, Some(snapshot))
            }
        }))
        .await;

        let mut recovered = Vec::new();
        let mut escalate = Vec::new();

        for (id, snapshot) in captures {
            let Some(snapshot) = snapshot else {
                flog_debug!("Cancelled before capturing {}", id);
                continue;
            };
            let Some(health) = self.health.get_mut(&id) else {
                continue;
            };
            if let Some(seen) = self.activity.last_seen(&id) {
                if health.last_activity.map_or(true, |t| seen > t) {
                    health.last_activity = Some(seen);
                }
            }

            let classification = match snapshot {
                Ok(text) => {
                    let hash = hash_string(&text);
                    // First sight after a restart keeps the restored timestamp
                    let changed = health.last_hash.map_or(true, |h| h != hash);
                    if changed && !health.resumed {
                        health.last_activity = Some(now);
                    }
                    health.last_hash = Some(hash);
                    health.resumed = false;
                    let idle_for = elapsed_since(now, health.last_activity);
                    self.classifier.classify(&id, &text, idle_for)
                }
                Err(e) => {
                    flog_warn!("Capture failed for {}: {}", id, e);
                    self.events.record_quietly(
                        Some(id.as_str()),
                        EventKind::CaptureFailed,
                        json!({"error": e.to_string()}),
                    );
                    self.classifier.classify_unavailable(&id, &e.to_string())
                }
            };

            let previous = std::mem::replace(&mut health.classification, classification);
            let current = health.classification.state();
            if previous.state() != current {
                flog!("{}: {} -> {}", id, previous.state(), current);
                self.events.record_quietly(
                    Some(id.as_str()),
                    EventKind::StateChanged,
                    json!({"from": previous.state(), "to": current, "rule": health.classification.rule()}),
                );
                if previous.state().is_stuck() && !current.is_stuck() {
                    recovered.push(id.clone());
                }
            }

            if current.is_stuck() {
                health.stuck_streak += 1;
                let threshold = self.settings.stuck_escalation_ticks;
                if threshold > 0 && health.stuck_streak == threshold {
                    escalate.push((id.clone(), current));
                }
            } else {
                health.stuck_streak = 0;
            }
        }

        for id in &recovered {
            self.resolve_stuck_alerts(id, "worker recovered").await;
        }
        for (id, state) in &escalate {
            self.raise_alert(
                id,
                Severity::High,
                kind::REPEATEDLY_STUCK,
                &format!(
                    "{} for {} consecutive checks",
                    state, self.settings.stuck_escalation_ticks
                ),
            )
            .await;
        }

        if self.cancel.is_cancelled() {
            flog_debug!("Cancelled before approvals");
        } else {
            self.run_approvals().await;
        }

        self.last_tick = Some(now);
        self.save_snapshot()
    }

    async fn run_approvals(&mut self) {
        let stuck: Vec<(String, Classification)> = self
            .health
            .iter()
            .filter(|(_, h)| h.classification.state().is_stuck())
            .map(|(id, h)| (id.clone(), h.classification.clone()))
            .collect();
        if stuck.is_empty() {
            return;
        }

        let results = join_all(stuck.iter().map(|(id, current)| {
            let engine = self.approvals.clone();
            async move { (id, engine.attempt_resolve(id, current).await) }
        }))
        .await;

        let now = Utc::now();
        let mut recovered = Vec::new();
        for (id, result) in results {
            let resolution = match result {
                Ok(resolution) => resolution,
                Err(e) => {
                    flog_error!("Approval for {} failed: {}", id, e);
                    continue;
                }
            };
            flog_debug!("Approval for {}: {}", id, resolution.outcome());
            let Some(after) = resolution.reclassified() else {
                continue;
            };
            let Some(health) = self.health.get_mut(id.as_str()) else {
                continue;
            };
            let before = health.classification.state();
            health.classification = after.clone();
            if after.state() != before {
                health.last_activity = Some(now);
                self.events.record_quietly(
                    Some(id.as_str()),
                    EventKind::StateChanged,
                    json!({"from": before, "to": after.state(), "rule": after.rule()}),
                );
            }
            if !after.state().is_stuck() {
                health.stuck_streak = 0;
            }
            if matches!(resolution, Resolution::Resolved { .. }) {
                recovered.push(id.clone());
            }
        }

        for id in &recovered {
            self.resolve_stuck_alerts(id, "auto-approved").await;
        }
    }

    async fn raise_alert(&self, worker_id: &str, severity: Severity, alert_kind: &str, message: &str) {
        let raised = {
            let mut alerts = self.alerts.lock().await;
            if let Err(e) = alerts.refresh() {
                flog_warn!("Failed to reload alerts: {}", e);
            }
            if alerts.find_open(worker_id, alert_kind).is_some() {
                return;
            }
            alerts.raise(worker_id, severity, alert_kind, message)
        };
        match raised {
            Ok(alert) => {
                flog_warn!("Alert {} [{}] {}: {}", alert.id, alert.severity, alert.kind, alert.message);
                self.events.record_quietly(
                    Some(worker_id),
                    EventKind::AlertRaised,
                    json!({"alert_id": alert.id, "kind": alert.kind, "severity": alert.severity}),
                );
                self.events.decision_quietly(
                    worker_id,
                    &format!("ALERT [{}] {}: {}", alert.severity, alert.kind, alert.message),
                );
            }
            Err(e) => flog_error!("Failed to record {} alert for {}: {}", alert_kind, worker_id, e),
        }
    }

    async fn resolve_alerts(&self, worker_id: &str, kinds: &[&str], resolution: &str) {
        let resolved = self.alerts.lock().await.resolve_kinds(worker_id, kinds, resolution);
        match resolved {
            Ok(alerts) => {
                for alert in alerts {
                    flog!("Alert {} ({}) resolved: {}", alert.id, alert.kind, resolution);
                    self.events.record_quietly(
                        Some(worker_id),
                        EventKind::AlertResolved,
                        json!({"alert_id": alert.id, "kind": alert.kind, "resolution": resolution}),
                    );
                }
            }
            Err(e) => flog_error!("Failed to resolve alerts for {}: {}", worker_id, e),
        }
    }

    async fn resolve_stuck_alerts(&self, worker_id: &str, resolution: &str) {
        self.resolve_alerts(worker_id, kind::STUCK_KINDS, resolution).await;
    }

    /// Pick up an archive made by `close-phase` while this monitor runs.
    fn adopt_external_seal(&mut self) {
        let path = self.paths.phase_state_file();
        match PhaseState::load(&path) {
            Ok(Some(on_disk)) => {
                if self.phase.adopt_seal(&on_disk) {
                    flog!(
                        "Phase {} was archived outside the monitor ({:?})",
                        self.phase.phase,
                        self.phase.archive_path
                    );
                }
            }
            Ok(None) => {}
            Err(e) => flog_warn!("Ignoring {}: {}", path.display(), e),
        }
    }

    fn save_phase(&mut self) -> Result<()> {
        self.adopt_external_seal();
        self.phase.save(&self.paths.phase_state_file())
    }

    /// Gather completion signals, apply the verdict and archive on completion.
    pub async fn check_completion(&mut self) -> Result<PhaseVerdict> {
        self.adopt_external_seal();
        if let Err(e) = self.alerts.lock().await.refresh() {
            flog_warn!("Failed to reload alerts: {}", e);
        }
        let detector = self.detector.clone();
        let state = self.phase.clone();
        let verdict = blocking(move || Ok(detector.evaluate(&state))).await?;

        let observed: Vec<_> = verdict
            .per_worker
            .values()
            .flat_map(|v| v.signals.iter().cloned())
            .collect();
        let fresh = self.phase.latch(&observed);
        for signal in &fresh {
            flog!(
                "{}: completion signal {} (observed {})",
                signal.worker_id,
                signal.source.as_str(),
                signal.observed_at
            );
            self.events.record_quietly(
                Some(signal.worker_id.as_str()),
                EventKind::SignalObserved,
                json!({"source": signal.source, "observed_at": signal.observed_at}),
            );
            self.events.decision_quietly(
                &signal.worker_id,
                &format!("signal={} observed", signal.source.as_str()),
            );
            self.resolve_alerts(&signal.worker_id, &[kind::NO_COMPLETION_SIGNAL], "signal observed")
                .await;
        }

        if self.phase.apply_verdict(&verdict) {
            flog!("Phase {} complete ({} mode)", verdict.phase, verdict.mode);
            self.events.record_quietly(
                None,
                EventKind::VerdictChanged,
                json!({"phase": verdict.phase, "mode": verdict.mode, "complete": true}),
            );
        }
        self.save_phase()?;

        self.check_signal_timeout(&verdict).await;

        if self.phase.complete && !self.phase.archived && !self.phase.archive_escalated {
            self.archive(&verdict).await?;
        }
        Ok(verdict)
    }

    async fn check_signal_timeout(&self, verdict: &PhaseVerdict) {
        let timeout = self.settings.signal_timeout();
        if elapsed_since(Utc::now(), Some(self.phase.started_at)) < timeout {
            return;
        }
        for (id, worker) in &verdict.per_worker {
            if worker.excluded || !worker.signals.is_empty() {
                continue;
            }
            self.raise_alert(
                id,
                Severity::High,
                kind::NO_COMPLETION_SIGNAL,
                &format!("no completion signal after {}s", timeout.as_secs()),
            )
            .await;
        }
    }

    async fn archive(&mut self, verdict: &PhaseVerdict) -> Result<()> {
        let archiver = self.archiver.clone();
        let registry = self.registry.clone();
        let verdict = verdict.clone();
        let mut state = self.phase.clone();
        let (state, result) = blocking(move || {
            let result = archiver.archive(&mut state, &registry, &verdict, ArchiveTrigger::Verdict);
            Ok((state, result))
        })
        .await?;
        self.phase = state;

        match result {
            Ok(ArchiveResult::Created(path)) => {
                self.events.record_quietly(
                    None,
                    EventKind::ArchiveCreated,
                    json!({"phase": self.phase.phase, "path": path}),
                );
                self.events.decision_quietly(
                    PHASE_SCOPE,
                    &format!("phase {} archived to {}", self.phase.phase, path.display()),
                );
                self.resolve_alerts(PHASE_SCOPE, &[kind::ARCHIVE_FAILED], "archived").await;
            }
            Ok(ArchiveResult::AlreadyArchived(path)) => {
                self.events.record_quietly(
                    None,
                    EventKind::ArchiveSkipped,
                    json!({"phase": self.phase.phase, "path": path}),
                );
            }
            Err(e) => {
                self.phase.archive_attempts += 1;
                flog_error!(
                    "Archive attempt {}/{} failed: {}",
                    self.phase.archive_attempts,
                    self.settings.max_archive_retries,
                    e
                );
                self.events.record_quietly(
                    None,
                    EventKind::ArchiveFailed,
                    json!({"phase": self.phase.phase, "attempt": self.phase.archive_attempts, "error": e.to_string()}),
                );
                if self.phase.archive_attempts >= self.settings.max_archive_retries {
                    self.phase.archive_escalated = true;
                    let escalated = Error::ArchiveEscalated {
                        phase: self.phase.phase,
                        attempts: self.phase.archive_attempts,
                    };
                    flog_error!("{}", escalated);
                    self.raise_alert(
                        PHASE_SCOPE,
                        Severity::High,
                        kind::ARCHIVE_FAILED,
                        &format!("{}: {}", escalated, e),
                    )
                    .await;
                }
                self.save_phase()?;
            }
        }
        Ok(())
    }

    fn save_snapshot(&self) -> Result<()> {
        let snapshot = MonitorSnapshot {
            pid: std::process::id(),
            phase: self.phase.phase,
            last_tick: self.last_tick,
            workers: self
                .health
                .iter()
                .map(|(id, h)| {
                    (
                        id.clone(),
                        WorkerSnapshot {
                            health: h.classification.state(),
                            rule: h.classification.rule().map(str::to_string),
                            last_activity: h.last_activity,
                            stuck_streak: h.stuck_streak,
                        },
                    )
                })
                .collect(),
        };
        write_json_atomic(&self.paths.monitor_state_file(), &snapshot)
    }

    /// Run until cancelled or a stop is requested.
    pub async fn run(&mut self) -> Result<()> {
        flog!(
            "Monitoring phase {} ({} workers, {} mode, auto_approve={})",
            self.phase.phase,
            self.health.len(),
            self.phase.mode,
            self.settings.auto_approve
        );
        self.events.record_quietly(
            None,
            EventKind::MonitorStarted,
            json!({
                "pid": std::process::id(),
                "phase": self.phase.phase,
                "workers": self.health.keys().collect::<Vec<_>>(),
                "mode": self.phase.mode,
                "archived": self.phase.archived,
            }),
        );

        let mut health_timer = tokio::time::interval(self.settings.health_interval());
        health_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut completion_timer = tokio::time::interval(self.settings.completion_interval());
        completion_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();
        let grace = self.settings.shutdown_grace();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    flog_debug!("Monitor cancelled");
                    break;
                }
                _ = health_timer.tick() => {
                    if let Err(e) = within_grace(&cancel, grace, self.tick()).await {
                        flog_error!("Health tick failed: {}", e);
                    }
                }
                _ = completion_timer.tick() => {
                    let check = async { self.check_completion().await.map(|_| ()) };
                    if let Err(e) = within_grace(&cancel, grace, check).await {
                        flog_error!("Completion check failed: {}", e);
                    }
                }
            }
        }

        if let Err(e) = self.save_snapshot() {
            flog_error!("Failed to save monitor state: {}", e);
        }
        self.save_phase()?;
        self.events.record_quietly(
            None,
            EventKind::MonitorStopped,
            json!({"pid": std::process::id(), "last_tick": self.last_tick}),
        );
        flog!("Monitor stopped");
        Ok(())
    }
}
