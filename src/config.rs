//! Project layout and configuration.
//!
//! A project directory (default `.foreman/`) holds the declarative worker
//! configuration (`config.json`), optional daemon settings (`foreman.toml`),
//! the logs and status files written by workers, and everything the daemon
//! writes back (state files, alerts, event logs, phase archives).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::util::expand_tilde;
use crate::{flog_debug, Error, Result};

pub const DEFAULT_PROJECT_DIR: &str = ".foreman";

/// Well-known paths inside a project directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let root = match root.to_str() {
            Some(s) => expand_tilde(s),
            None => root.to_path_buf(),
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("foreman.toml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn worker_log(&self, worker_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", worker_id))
    }

    /// Shared event stream written by workers (`logs/events.jsonl`).
    pub fn worker_events_file(&self) -> PathBuf {
        self.logs_dir().join("events.jsonl")
    }

    pub fn status_dir(&self) -> PathBuf {
        self.root.join("status")
    }

    pub fn worker_status_dir(&self) -> PathBuf {
        self.status_dir().join("workers")
    }

    pub fn worker_status_file(&self, worker_id: &str) -> PathBuf {
        self.worker_status_dir().join(format!("{}.json", worker_id))
    }

    pub fn phase_state_file(&self) -> PathBuf {
        self.status_dir().join("phase-state.json")
    }

    pub fn monitor_state_file(&self) -> PathBuf {
        self.status_dir().join("monitor-state.json")
    }

    pub fn alerts_file(&self) -> PathBuf {
        self.status_dir().join("alerts.jsonl")
    }

    pub fn event_log_file(&self) -> PathBuf {
        self.status_dir().join("monitor-events.jsonl")
    }

    pub fn decisions_log(&self) -> PathBuf {
        self.status_dir().join("decisions.log")
    }

    pub fn diagnostic_log(&self) -> PathBuf {
        self.status_dir().join("foreman.log")
    }

    pub fn stop_file(&self) -> PathBuf {
        self.status_dir().join("STOP")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.root.join("workers")
    }

    pub fn worker_prompt(&self, worker_id: &str) -> PathBuf {
        self.workers_dir().join(format!("{}.md", worker_id))
    }

    pub fn phases_dir(&self) -> PathBuf {
        self.root.join("phases")
    }
}

/// Declarative project configuration as read from `config.json`.
///
/// Numeric and enum-like fields are kept loose here; the registry does the
/// validation so every problem is reported as a single fatal error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project: ProjectInfo,
    #[serde(default = "default_phase")]
    pub phase: i64,
    #[serde(default)]
    pub completion: CompletionConfig,
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Worker roles left out of the phase-level completion criterion.
    #[serde(default)]
    pub exclude_roles: Vec<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            exclude_roles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    #[serde(default = "default_agent")]
    pub agent: String,
    pub branch: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Defaults to the project-level phase.
    #[serde(default)]
    pub phase: Option<i64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Explicit tmux target (`session:window`); derived from position otherwise.
    #[serde(default)]
    pub tmux_target: Option<String>,
}

fn default_phase() -> i64 {
    1
}

fn default_mode() -> String {
    "any".to_string()
}

fn default_agent() -> String {
    "claude".to_string()
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self> {
        flog_debug!("ProjectConfig::load path={}", path.display());
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Validation(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Validation(format!("invalid config.json: {}", e)))
    }

    /// Slug used for the tmux session name.
    pub fn slug(&self) -> String {
        match &self.project.slug {
            Some(slug) if !slug.trim().is_empty() => slug.trim().to_string(),
            _ => self
                .project
                .name
                .to_lowercase()
                .chars()
                .map(|c| if c.is_alphanumeric() { c } else { '-' })
                .collect(),
        }
    }

    /// Version tag used to key phase archives.
    pub fn version_tag(&self) -> String {
        self.project
            .version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("v1")
            .to_string()
    }
}

/// Daemon tuning knobs, read from `foreman.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub health_interval_secs: u64,
    pub completion_interval_secs: u64,
    pub approval_cooldown_secs: u64,
    pub verify_delay_ms: u64,
    pub check_timeout_ms: u64,
    pub capture_lines: u16,
    /// Prompt rules only look at this many lines from the bottom of the pane.
    pub prompt_window_lines: usize,
    pub idle_threshold_secs: u64,
    pub signal_timeout_secs: u64,
    pub max_archive_retries: u32,
    pub stuck_escalation_ticks: u32,
    pub shutdown_grace_ms: u64,
    pub auto_approve: bool,
    pub tmux_session: Option<String>,
    pub base_branch: String,
    pub completion_markers: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            health_interval_secs: 30,
            completion_interval_secs: 120,
            approval_cooldown_secs: 30,
            verify_delay_ms: 1500,
            check_timeout_ms: 5000,
            capture_lines: 100,
            prompt_window_lines: 15,
            idle_threshold_secs: 300,
            signal_timeout_secs: 7200,
            max_archive_retries: 3,
            stuck_escalation_ticks: 3,
            shutdown_grace_ms: 2000,
            auto_approve: true,
            tmux_session: None,
            base_branch: "main".to_string(),
            completion_markers: vec!["WORKER_COMPLETE".to_string(), "PHASE_COMPLETE".to_string()],
        }
    }
}

impl MonitorSettings {
    /// Load settings, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        flog_debug!("MonitorSettings::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Settings file not found, using defaults");
            return Ok(Self::default());
        }
        let settings: Self = toml::from_str(&fs::read_to_string(path)?)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_interval_secs == 0 || self.completion_interval_secs == 0 {
            return Err(Error::Validation(
                "check intervals must be greater than zero".to_string(),
            ));
        }
        if self.capture_lines == 0 {
            return Err(Error::Validation("capture_lines must be positive".to_string()));
        }
        if self.completion_markers.iter().all(|m| m.trim().is_empty()) {
            return Err(Error::Validation(
                "at least one completion marker is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn completion_interval(&self) -> Duration {
        Duration::from_secs(self.completion_interval_secs)
    }

    pub fn approval_cooldown(&self) -> Duration {
        Duration::from_secs(self.approval_cooldown_secs)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn signal_timeout(&self) -> Duration {
        Duration::from_secs(self.signal_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn session_name(&self, config: &ProjectConfig) -> String {
        self.tmux_session
            .clone()
            .unwrap_or_else(|| format!("foreman-{}", config.slug()))
    }
}
