//! Persistent state of the active phase (`status/phase-state.json`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::completion::{CompletionSignal, PhaseVerdict};
use crate::registry::{ConsensusMode, Registry};
use crate::util::write_json_atomic;
use crate::{flog, flog_debug, flog_warn, Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCompletion {
    pub satisfied: bool,
    /// Latched signals: once observed, never retracted within the phase.
    pub signals: Vec<CompletionSignal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase: u32,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub mode: ConsensusMode,
    /// Base branch commit at phase start, used by the merged-branch check.
    #[serde(default)]
    pub base_commit: Option<String>,
    pub workers: BTreeMap<String, WorkerCompletion>,
    pub complete: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub archived: bool,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    #[serde(default)]
    pub archive_attempts: u32,
    #[serde(default)]
    pub archive_escalated: bool,
}

impl PhaseState {
    pub fn start(registry: &Registry, version: &str, base_commit: Option<String>) -> Self {
        let phase = registry.active_phase();
        Self {
            phase,
            version: version.to_string(),
            started_at: Utc::now(),
            mode: registry.mode(),
            base_commit,
            workers: registry
                .workers_in_phase(phase)
                .into_iter()
                .map(|w| (w.id.clone(), WorkerCompletion::default()))
                .collect(),
            complete: false,
            completed_at: None,
            archived: false,
            archived_at: None,
            archive_path: None,
            archive_attempts: 0,
            archive_escalated: false,
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let state = serde_json::from_str(&content).map_err(|e| {
            Error::State(format!("unreadable {}: {}", path.display(), e))
        })?;
        Ok(Some(state))
    }

    /// Resume the saved state when it belongs to the configured phase,
    /// otherwise start fresh. `base_commit` is only consulted for a fresh start.
    pub fn resume_or_start(
        path: &Path,
        registry: &Registry,
        version: &str,
        base_commit: impl FnOnce() -> Option<String>,
    ) -> Result<Self> {
        if let Some(mut saved) = Self::load(path)? {
            if saved.phase == registry.active_phase() && saved.version == version {
                if saved.mode != registry.mode() {
                    flog_warn!(
                        "Completion mode changed from {} to {} for phase {}",
                        saved.mode,
                        registry.mode(),
                        saved.phase
                    );
                    saved.mode = registry.mode();
                    if !saved.archived {
                        // The next check recomputes the verdict under the new mode
                        saved.complete = false;
                        saved.completed_at = None;
                        for worker in saved.workers.values_mut() {
                            worker.satisfied = false;
                        }
                    }
                }
                for worker in registry.workers_in_phase(saved.phase) {
                    saved.workers.entry(worker.id.clone()).or_default();
                }
                flog!(
                    "Resuming phase {} (archived={}, started {})",
                    saved.phase,
                    saved.archived,
                    saved.started_at
                );
                return Ok(saved);
            }
            flog!(
                "Saved state is for phase {}-{}, starting phase {}-{}",
                saved.phase,
                saved.version,
                registry.active_phase(),
                version
            );
        }
        let state = Self::start(registry, version, base_commit());
        state.save(path)?;
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        flog_debug!("PhaseState::save phase={} path={}", self.phase, path.display());
        write_json_atomic(path, self)
    }

    /// All latched signals, across workers.
    pub fn latched_signals(&self) -> Vec<CompletionSignal> {
        self.workers
            .values()
            .flat_map(|w| w.signals.iter().cloned())
            .collect()
    }

    /// Latch new observations. Returns the signals seen for the first time.
    /// A repeat observation of a latched source can only move its
    /// `observed_at` earlier.
    pub fn latch(&mut self, signals: &[CompletionSignal]) -> Vec<CompletionSignal> {
        let mut fresh = Vec::new();
        for signal in signals {
            let entry = self.workers.entry(signal.worker_id.clone()).or_default();
            if let Some(seen) = entry.signals.iter_mut().find(|s| s.source == signal.source) {
                if signal.observed_at < seen.observed_at {
                    seen.observed_at = signal.observed_at;
                }
                continue;
            }
            entry.signals.push(signal.clone());
            entry.signals.sort_by_key(|s| s.source);
            fresh.push(signal.clone());
        }
        fresh
    }

    /// Record a verdict. Returns true when the phase flipped to complete.
    pub fn apply_verdict(&mut self, verdict: &PhaseVerdict) -> bool {
        for (id, v) in &verdict.per_worker {
            self.workers.entry(id.clone()).or_default().satisfied = v.satisfied;
        }
        let flipped = verdict.complete && !self.complete;
        if flipped {
            self.completed_at = Some(Utc::now());
        }
        // Signals are latched, so a verdict never goes back to incomplete
        self.complete = self.complete || verdict.complete;
        flipped
    }

    /// Adopt a seal written by another process (`foreman close-phase`).
    /// Returns true when this state was unsealed and now is sealed; the
    /// archived flag never goes back to false.
    pub fn adopt_seal(&mut self, on_disk: &PhaseState) -> bool {
        if self.archived
            || !on_disk.archived
            || on_disk.phase != self.phase
            || on_disk.version != self.version
        {
            return false;
        }
        self.archived = true;
        self.archived_at = on_disk.archived_at;
        self.archive_path = on_disk.archive_path.clone();
        true
    }

    pub(crate) fn mark_archived(&mut self, archive_path: &Path) {
        self.archived = true;
        self.archived_at = Some(Utc::now());
        self.archive_path = Some(archive_path.to_path_buf());
    }

    /// `phase-<n>-<version>`
    pub fn archive_dir_name(&self) -> String {
        format!("phase-{}-{}", self.phase, self.version)
    }
}
