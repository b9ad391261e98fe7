//! Phase completion: gather completion signals per worker and combine them
//! into a verdict under the configured consensus mode.
//!
//! Gathering only reads files and branch state. Turning signals into a
//! verdict is a pure function; acting on the verdict is the monitor's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::phase::PhaseState;
use crate::config::ProjectPaths;
use crate::git::BranchStatus;
use crate::registry::{ConsensusMode, Registry, Worker};
use crate::{flog_debug, flog_warn, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    LogMarker,
    BranchMerged,
    StatusFile,
}

impl SignalSource {
    pub const ALL: [SignalSource; 3] = [
        SignalSource::LogMarker,
        SignalSource::BranchMerged,
        SignalSource::StatusFile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::LogMarker => "log_marker",
            SignalSource::BranchMerged => "branch_merged",
            SignalSource::StatusFile => "status_file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub worker_id: String,
    pub source: SignalSource,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerVerdict {
    pub signals: Vec<CompletionSignal>,
    pub satisfied: bool,
    /// Role excluded from the phase-level criterion.
    pub excluded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseVerdict {
    pub phase: u32,
    pub mode: ConsensusMode,
    pub complete: bool,
    pub per_worker: BTreeMap<String, WorkerVerdict>,
}

/// Does this set of signal sources satisfy `mode`?
pub fn satisfies(mode: ConsensusMode, sources: &BTreeSet<SignalSource>) -> bool {
    let has = |s| sources.contains(&s);
    match mode {
        ConsensusMode::Any => !sources.is_empty(),
        ConsensusMode::Strict => {
            has(SignalSource::LogMarker)
                && (has(SignalSource::BranchMerged) || has(SignalSource::StatusFile))
        }
        ConsensusMode::All => SignalSource::ALL.iter().all(|s| sources.contains(s)),
    }
}

/// Combine signals into a verdict for `phase`.
///
/// For each worker and source the earliest observation wins, so feeding the
/// same signals in any order gives the same verdict. The phase is complete
/// when it has at least one counted worker and every counted worker is
/// satisfied.
pub fn verdict(registry: &Registry, phase: u32, signals: &[CompletionSignal]) -> PhaseVerdict {
    let mode = registry.mode();
    let mut per_worker = BTreeMap::new();

    for worker in registry.workers_in_phase(phase) {
        let mut earliest: BTreeMap<SignalSource, CompletionSignal> = BTreeMap::new();
        for signal in signals.iter().filter(|s| s.worker_id == worker.id) {
            let keep_seen = earliest
                .get(&signal.source)
                .map(|seen| seen.observed_at <= signal.observed_at)
                .unwrap_or(false);
            if !keep_seen {
                earliest.insert(signal.source, signal.clone());
            }
        }
        let sources: BTreeSet<SignalSource> = earliest.keys().copied().collect();
        per_worker.insert(
            worker.id.clone(),
            WorkerVerdict {
                satisfied: satisfies(mode, &sources),
                signals: earliest.into_values().collect(),
                excluded: registry.is_excluded(worker),
            },
        );
    }

    let counted: Vec<&WorkerVerdict> = per_worker.values().filter(|v| !v.excluded).collect();
    let complete = !counted.is_empty() && counted.iter().all(|v| v.satisfied);

    PhaseVerdict {
        phase,
        mode,
        complete,
        per_worker,
    }
}

/// Reads the evidence workers leave behind.
#[derive(Clone)]
pub struct SignalCollector {
    paths: ProjectPaths,
    markers: Vec<String>,
    branches: Arc<dyn BranchStatus>,
}

/// A record of the shared `logs/events.jsonl` stream.
#[derive(Debug, Deserialize)]
struct WorkerEvent {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    worker: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

impl WorkerEvent {
    fn worker_id(&self) -> Option<&str> {
        self.worker.as_deref().or(self.source.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct WorkerStatusFile {
    status: String,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

const DONE_STATUSES: &[&str] = &["complete", "completed", "done"];

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.f]` taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

impl SignalCollector {
    pub fn new(paths: ProjectPaths, markers: Vec<String>, branches: Arc<dyn BranchStatus>) -> Self {
        let markers = markers
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        Self {
            paths,
            markers,
            branches,
        }
    }

    /// All signals currently observable for `worker`. A source that cannot
    /// be read counts as absent.
    pub fn collect(&self, worker: &Worker) -> Vec<CompletionSignal> {
        let mut signals = Vec::new();
        let mut push = |source, observed_at| {
            signals.push(CompletionSignal {
                worker_id: worker.id.clone(),
                source,
                observed_at,
            })
        };

        if let Some(at) = self.log_marker(worker) {
            push(SignalSource::LogMarker, at);
        }
        match self.branch_merged(worker) {
            Ok(Some(at)) => push(SignalSource::BranchMerged, at),
            Ok(None) => {}
            Err(e) => flog_warn!("Branch check for {} ({}) failed: {}", worker.id, worker.branch, e),
        }
        if let Some(at) = self.status_file(worker) {
            push(SignalSource::StatusFile, at);
        }
        flog_debug!("Signals for {}: {}", worker.id, signals.len());
        signals
    }

    fn log_marker(&self, worker: &Worker) -> Option<DateTime<Utc>> {
        let log = self.paths.worker_log(&worker.id);
        if let Ok(content) = fs::read_to_string(&log) {
            if content
                .lines()
                .any(|l| self.markers.iter().any(|m| l.contains(m.as_str())))
            {
                return modified_at(&log);
            }
        }

        let events = self.paths.worker_events_file();
        let content = fs::read_to_string(&events).ok()?;
        content
            .lines()
            .filter_map(|l| serde_json::from_str::<WorkerEvent>(l).ok())
            .find(|e| {
                e.worker_id() == Some(worker.id.as_str())
                    && e.event
                        .as_deref()
                        .map(|ev| self.markers.iter().any(|m| m == ev))
                        .unwrap_or(false)
            })
            .and_then(|e| {
                e.timestamp
                    .as_deref()
                    .and_then(parse_timestamp)
                    .or_else(|| modified_at(&events))
            })
    }

    fn branch_merged(&self, worker: &Worker) -> Result<Option<DateTime<Utc>>> {
        if !self.branches.is_branch_merged(&worker.branch)? {
            return Ok(None);
        }
        Ok(Some(
            self.branches
                .tip_time(&worker.branch)?
                .unwrap_or_else(Utc::now),
        ))
    }

    fn status_file(&self, worker: &Worker) -> Option<DateTime<Utc>> {
        let path = self.paths.worker_status_file(&worker.id);
        let content = fs::read_to_string(&path).ok()?;
        let status: WorkerStatusFile = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                flog_warn!("Unreadable status file {}: {}", path.display(), e);
                return None;
            }
        };
        if !DONE_STATUSES.contains(&status.status.trim().to_lowercase().as_str()) {
            return None;
        }
        status.updated_at.or_else(|| modified_at(&path))
    }
}

#[derive(Clone)]
pub struct CompletionDetector {
    registry: Arc<Registry>,
    collector: SignalCollector,
}

impl CompletionDetector {
    pub fn new(registry: Arc<Registry>, collector: SignalCollector) -> Self {
        Self {
            registry,
            collector,
        }
    }

    /// Signals observable right now for every worker in `phase`.
    pub fn gather(&self, phase: u32) -> Vec<CompletionSignal> {
        self.registry
            .workers_in_phase(phase)
            .into_iter()
            .flat_map(|w| self.collector.collect(w))
            .collect()
    }

    /// Verdict over fresh observations plus the signals latched in `state`.
    /// Writes nothing.
    pub fn evaluate(&self, state: &PhaseState) -> PhaseVerdict {
        let mut signals = state.latched_signals();
        signals.extend(self.gather(state.phase));
        verdict(&self.registry, state.phase, &signals)
    }
}
