//! Auto-approval: type the suggested keystrokes into a stuck worker, then
//! look again to see whether it moved on.

use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::alerts::{kind, AlertLog, Severity};
use super::classifier::{Classification, Classifier, HealthState};
use super::events::{EventKind, EventLog};
use crate::session::SessionBackend;
use crate::util::blocking_with_timeout;
use crate::{flog_debug, flog_warn, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Worker is not stuck, or there is nothing to send.
    NotApplicable,
    /// A previous attempt is too recent.
    CoolingDown { remaining: Duration },
    /// The worker left the stuck state.
    Resolved { after: Classification },
    /// Keys were sent but the worker is still stuck.
    Unresolved { after: Classification, alert_id: String },
    /// The session rejected the keystrokes.
    InjectionFailed { alert_id: String },
    /// Operator action needed: auto-approve is off, or the prompt has no
    /// affirmative option to pick.
    Escalated { alert_id: String },
}

impl Resolution {
    /// The classification taken after injecting, if the worker was re-checked.
    pub fn reclassified(&self) -> Option<&Classification> {
        match self {
            Resolution::Resolved { after } | Resolution::Unresolved { after, .. } => Some(after),
            _ => None,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            Resolution::NotApplicable => "not_applicable",
            Resolution::CoolingDown { .. } => "cooling_down",
            Resolution::Resolved { .. } => "resolved",
            Resolution::Unresolved { .. } => "unresolved",
            Resolution::InjectionFailed { .. } => "injection_failed",
            Resolution::Escalated { .. } => "escalated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalSettings {
    pub auto_approve: bool,
    pub cooldown: Duration,
    pub verify_delay: Duration,
    pub check_timeout: Duration,
    pub capture_lines: u16,
}

/// Per-worker slot. Holding its lock is what serializes injections.
#[derive(Default)]
struct Slot {
    last_attempt: Option<Instant>,
}

pub struct ApprovalEngine {
    sessions: Arc<dyn SessionBackend>,
    classifier: Arc<Classifier>,
    alerts: Arc<Mutex<AlertLog>>,
    events: EventLog,
    settings: ApprovalSettings,
    slots: StdMutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

fn severity_for(state: HealthState) -> Severity {
    match state {
        HealthState::StuckEditing => Severity::Medium,
        _ => Severity::High,
    }
}

fn kind_for(state: HealthState) -> &'static str {
    match state {
        HealthState::StuckEditing => kind::STUCK_EDITING,
        _ => kind::STUCK_APPROVAL,
    }
}

impl ApprovalEngine {
    pub fn new(
        sessions: Arc<dyn SessionBackend>,
        classifier: Arc<Classifier>,
        alerts: Arc<Mutex<AlertLog>>,
        events: EventLog,
        settings: ApprovalSettings,
    ) -> Self {
        Self {
            sessions,
            classifier,
            alerts,
            events,
            settings,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    fn slot(&self, worker_id: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(worker_id.to_string()).or_default().clone()
    }

    async fn raise(&self, worker_id: &str, severity: Severity, alert_kind: &str, message: &str) -> Result<String> {
        let alert = {
            let mut alerts = self.alerts.lock().await;
            alerts.refresh()?;
            if let Some(open) = alerts.find_open(worker_id, alert_kind) {
                return Ok(open.id.clone());
            }
            alerts.raise(worker_id, severity, alert_kind, message)?
        };
        self.events.record_quietly(
            Some(worker_id),
            EventKind::AlertRaised,
            json!({"alert_id": alert.id, "kind": alert.kind, "severity": alert.severity}),
        );
        self.events.decision_quietly(
            worker_id,
            &format!("ALERT [{}] {}: {}", alert.severity, alert.kind, alert.message),
        );
        Ok(alert.id)
    }

    /// Try to unstick `worker_id`, currently classified as `current`.
    pub async fn attempt_resolve(&self, worker_id: &str, current: &Classification) -> Result<Resolution> {
        let state = current.state();
        if !state.is_stuck() {
            return Ok(Resolution::NotApplicable);
        }

        let slot = self.slot(worker_id);
        let mut slot = slot.lock().await;

        if let Some(last) = slot.last_attempt {
            let elapsed = last.elapsed();
            if elapsed < self.settings.cooldown {
                let remaining = self.settings.cooldown - elapsed;
                flog_debug!("Approval for {} cooling down ({:?} left)", worker_id, remaining);
                return Ok(Resolution::CoolingDown { remaining });
            }
        }
        slot.last_attempt = Some(Instant::now());

        let Some(action) = current.action().cloned() else {
            let alert_id = self
                .raise(
                    worker_id,
                    severity_for(state),
                    kind_for(state),
                    &format!("{} with no affirmative option to select", state),
                )
                .await?;
            return Ok(Resolution::Escalated { alert_id });
        };

        if !self.settings.auto_approve {
            self.events.record_quietly(
                Some(worker_id),
                EventKind::ApprovalSkipped,
                json!({"state": state, "action": action.label, "reason": "auto_approve disabled"}),
            );
            let alert_id = self
                .raise(
                    worker_id,
                    severity_for(state),
                    kind::APPROVAL_REQUIRED,
                    &format!("{}: would {}, auto-approve is disabled", state, action.label),
                )
                .await?;
            return Ok(Resolution::Escalated { alert_id });
        }

        let sessions = self.sessions.clone();
        let id = worker_id.to_string();
        let keys = action.keys.clone();
        let injected = blocking_with_timeout(self.settings.check_timeout, move || {
            sessions.inject(&id, &keys)
        })
        .await;

        if let Err(e) = injected {
            flog_warn!("Injection into {} failed: {}", worker_id, e);
            self.events.record_quietly(
                Some(worker_id),
                EventKind::InjectionFailed,
                json!({"state": state, "action": action.label, "keys": action.keys, "error": e.to_string()}),
            );
            self.events.decision_quietly(
                worker_id,
                &format!("state={}, action={}, outcome=injection_failed ({})", state, action.label, e),
            );
            let alert_id = self
                .raise(
                    worker_id,
                    Severity::High,
                    kind::INJECTION_FAILED,
                    &format!("could not send '{}': {}", action.label, e),
                )
                .await?;
            return Ok(Resolution::InjectionFailed { alert_id });
        }

        tokio::time::sleep(self.settings.verify_delay).await;

        let sessions = self.sessions.clone();
        let id = worker_id.to_string();
        let lines = self.settings.capture_lines;
        let after = match blocking_with_timeout(self.settings.check_timeout, move || {
            sessions.capture(&id, lines)
        })
        .await
        {
            Ok(snapshot) => self.classifier.classify(worker_id, &snapshot, Duration::ZERO),
            Err(e) => self.classifier.classify_unavailable(worker_id, &e.to_string()),
        };

        let verified = after.rule() != Some("capture_failed");
        if verified && after.state() != state {
            flog_debug!("Approval resolved {}: {} -> {}", worker_id, state, after.state());
            self.events.record_quietly(
                Some(worker_id),
                EventKind::ApprovalSucceeded,
                json!({"state_before": state, "state_after": after.state(), "action": action.label, "keys": action.keys}),
            );
            self.events.decision_quietly(
                worker_id,
                &format!("state={}, action={}, outcome=resolved ({})", state, action.label, after.state()),
            );
            return Ok(Resolution::Resolved { after });
        }

        self.events.record_quietly(
            Some(worker_id),
            EventKind::ApprovalFailed,
            json!({"state_before": state, "state_after": after.state(), "action": action.label, "keys": action.keys, "verified": verified}),
        );
        self.events.decision_quietly(
            worker_id,
            &format!("state={}, action={}, outcome=unresolved", state, action.label),
        );
        let message = if verified {
            format!("still {} after '{}'", state, action.label)
        } else {
            format!("could not verify '{}': capture failed", action.label)
        };
        let alert_id = self
            .raise(worker_id, severity_for(state), kind_for(state), &message)
            .await?;
        Ok(Resolution::Unresolved { after, alert_id })
    }
}
