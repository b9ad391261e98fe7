//! Phase archiver.
//!
//! An archive is built in a hidden temp directory next to its final
//! location and renamed into place as the last step, so
//! `phases/phase-<n>-<version>/` either exists complete or not at all.

use chrono::Utc;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use super::completion::PhaseVerdict;
use super::phase::PhaseState;
use crate::config::{MonitorSettings, ProjectPaths};
use crate::registry::Registry;
use crate::util::write_json_atomic;
use crate::{flog, flog_debug, flog_warn, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveTrigger {
    /// The completion verdict flipped to complete.
    Verdict,
    /// Operator ran close-phase.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveResult {
    Created(PathBuf),
    /// Nothing was written.
    AlreadyArchived(Option<PathBuf>),
}

#[derive(Clone)]
pub struct Archiver {
    paths: ProjectPaths,
    settings: MonitorSettings,
}

impl Archiver {
    pub fn new(paths: ProjectPaths, settings: MonitorSettings) -> Self {
        Self { paths, settings }
    }

    pub fn archive_path(&self, state: &PhaseState) -> PathBuf {
        self.paths.phases_dir().join(state.archive_dir_name())
    }

    /// Archive the phase and mark `state` archived (saved to disk).
    ///
    /// On failure nothing is left under the final path and `state` is not
    /// marked; the error is `Error::Archive`.
    pub fn archive(
        &self,
        state: &mut PhaseState,
        registry: &Registry,
        verdict: &PhaseVerdict,
        trigger: ArchiveTrigger,
    ) -> Result<ArchiveResult> {
        if state.archived {
            flog_warn!(
                "Phase {} is already archived at {:?}, skipping",
                state.phase,
                state.archive_path
            );
            return Ok(ArchiveResult::AlreadyArchived(state.archive_path.clone()));
        }

        let final_path = self.archive_path(state);
        if final_path.exists() {
            // Renamed into place by an earlier run that died before saving state
            flog_warn!(
                "Archive {} already exists, adopting it",
                final_path.display()
            );
            state.mark_archived(&final_path);
            state.save(&self.paths.phase_state_file())?;
            return Ok(ArchiveResult::AlreadyArchived(Some(final_path)));
        }

        let phases_dir = self.paths.phases_dir();
        let tmp = phases_dir.join(format!(
            ".{}.tmp-{}",
            state.archive_dir_name(),
            std::process::id()
        ));

        let built = fs::create_dir_all(&phases_dir)
            .map_err(Error::from)
            .and_then(|_| {
                if tmp.exists() {
                    fs::remove_dir_all(&tmp)?;
                }
                self.build(&tmp, state, registry, verdict, trigger)
            })
            .and_then(|_| Ok(fs::rename(&tmp, &final_path)?));

        if let Err(e) = built {
            if tmp.exists() {
                if let Err(cleanup) = fs::remove_dir_all(&tmp) {
                    flog_warn!("Failed to remove {}: {}", tmp.display(), cleanup);
                }
            }
            return Err(Error::Archive {
                phase: state.phase,
                reason: e.to_string(),
            });
        }

        state.mark_archived(&final_path);
        state.save(&self.paths.phase_state_file())?;
        flog!("Phase {} archived to {}", state.phase, final_path.display());
        Ok(ArchiveResult::Created(final_path))
    }

    fn build(
        &self,
        dir: &Path,
        state: &PhaseState,
        registry: &Registry,
        verdict: &PhaseVerdict,
        trigger: ArchiveTrigger,
    ) -> Result<()> {
        flog_debug!("Building archive in {}", dir.display());
        fs::create_dir_all(dir)?;

        let config_dir = dir.join("config");
        fs::create_dir_all(&config_dir)?;
        fs::copy(self.paths.config_file(), config_dir.join("config.json"))?;
        let settings_file = self.paths.settings_file();
        if settings_file.exists() {
            fs::copy(&settings_file, config_dir.join("foreman.toml"))?;
        }
        write_json_atomic(&config_dir.join("effective-settings.json"), &self.settings)?;

        copy_dir(&self.paths.logs_dir(), &dir.join("logs"))?;
        copy_dir(&self.paths.workers_dir(), &dir.join("workers"))?;
        copy_dir(&self.paths.worker_status_dir(), &dir.join("status").join("workers"))?;
        let status_dir = self.paths.status_dir();
        for name in ["alerts.jsonl", "monitor-events.jsonl", "decisions.log", "monitor-state.json"] {
            let src = status_dir.join(name);
            if src.exists() {
                fs::create_dir_all(dir.join("status"))?;
                fs::copy(&src, dir.join("status").join(name))?;
            }
        }

        let mut sealed = state.clone();
        sealed.mark_archived(&self.archive_path(state));
        write_json_atomic(&dir.join("phase-state.json"), &sealed)?;
        write_json_atomic(&dir.join("verdict.json"), verdict)?;
        fs::write(dir.join("workers.json"), serde_json::to_string_pretty(registry.workers())?)?;

        fs::write(dir.join("SUMMARY.md"), summary(state, registry, verdict, trigger))?;
        Ok(())
    }
}

/// Recursively copy `src` into `dst`. A missing `src` copies nothing.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn summary(
    state: &PhaseState,
    registry: &Registry,
    verdict: &PhaseVerdict,
    trigger: ArchiveTrigger,
) -> String {
    let now = Utc::now();
    let duration = now - state.started_at;
    let mut out = String::new();

    let _ = writeln!(out, "# {} phase {} ({})", registry.project().name, state.phase, state.version);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Started: {}", state.started_at.to_rfc3339());
    let _ = writeln!(out, "- Archived: {}", now.to_rfc3339());
    let _ = writeln!(
        out,
        "- Duration: {}h {:02}m",
        duration.num_hours(),
        duration.num_minutes() % 60
    );
    let _ = writeln!(out, "- Completion mode: {}", verdict.mode);
    let closed = match trigger {
        ArchiveTrigger::Verdict => "completion verdict",
        ArchiveTrigger::Manual => "manual close",
    };
    let _ = writeln!(out, "- Closed by: {}", closed);
    let _ = writeln!(
        out,
        "- Verdict at close: {}",
        if verdict.complete { "complete" } else { "incomplete" }
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "## Workers");
    let _ = writeln!(out);
    let _ = writeln!(out, "| Worker | Branch | Role | Signals | Satisfied |");
    let _ = writeln!(out, "|---|---|---|---|---|");
    for worker in registry.workers_in_phase(state.phase) {
        let (signals, satisfied) = match verdict.per_worker.get(&worker.id) {
            Some(v) => {
                let names: Vec<&str> = v.signals.iter().map(|s| s.source.as_str()).collect();
                let satisfied = if v.excluded {
                    "excluded"
                } else if v.satisfied {
                    "yes"
                } else {
                    "no"
                };
                (names.join(", "), satisfied)
            }
            None => (String::new(), "no"),
        };
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} |",
            worker.id,
            worker.branch,
            worker.role.as_deref().unwrap_or("-"),
            if signals.is_empty() { "-".to_string() } else { signals },
            satisfied
        );
    }
    out
}
