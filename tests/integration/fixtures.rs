//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Writing a project directory (config.json, foreman.toml)
//! - Scripted terminal screens and branch states
//! - Building a monitor context over the in-memory backends

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use foreman::config::ProjectPaths;
use foreman::git::MemoryBranches;
use foreman::monitor::{EventKind, PhaseState};
use foreman::session::MemorySessions;
use foreman::{MonitorContext, Project};

/// A numbered two-option prompt ending in a Y/n hint.
pub const YES_NO_PROMPT: &str = "\
Running migrations...
Do you want to proceed with the migration?
  1. Yes
  2. No
(Y/n)";

/// The usual three-option permission prompt.
pub const PERMISSION_PROMPT: &str = "\
● Bash(cargo test)
Do you want to run this command?
❯ 1. Yes
  2. Yes, and don't ask again for cargo commands
  3. No, and tell Claude what to do differently (esc)";

pub const WORKING: &str = "● Reading src/lib.rs\n✻ Pondering… (esc to interrupt)";

pub const EDIT_PROMPT: &str = "\
Do you want to make this edit to lib.rs?
❯ 1. Yes
  2. No";

/// Settings that keep the loop fast under test.
pub const FAST_SETTINGS: &str = "\
health_interval_secs = 1
completion_interval_secs = 1
approval_cooldown_secs = 0
verify_delay_ms = 10
check_timeout_ms = 300
shutdown_grace_ms = 200
";

/// A project directory in a temp dir plus in-memory sessions and branches.
pub struct TestProject {
    pub temp_dir: TempDir,
    pub paths: ProjectPaths,
    pub sessions: Arc<MemorySessions>,
    pub branches: Arc<MemoryBranches>,
}

impl TestProject {
    /// Three workers in phase 1 (`api`, `ui`, and an excluded `qa`) and one
    /// in phase 2.
    pub fn new(mode: &str, extra_settings: &str) -> Self {
        let config = format!(
            r#"{{
                "project": {{"name": "Demo", "slug": "demo", "version": "v1"}},
                "phase": 1,
                "completion": {{"mode": "{}", "exclude_roles": ["integration"]}},
                "workers": [
                    {{"id": "api", "branch": "feat/api", "description": "REST API"}},
                    {{"id": "ui", "branch": "feat/ui", "dependencies": ["api"]}},
                    {{"id": "qa", "branch": "feat/qa", "role": "integration", "dependencies": ["api", "ui"]}},
                    {{"id": "docs", "branch": "feat/docs", "phase": 2}}
                ]
            }}"#,
            mode
        );
        Self::with_config(&config, &format!("{}{}", FAST_SETTINGS, extra_settings))
    }

    pub fn with_config(config: &str, settings: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let paths = ProjectPaths::new(temp_dir.path());
        fs::write(paths.config_file(), config).expect("Failed to write config.json");
        fs::write(paths.settings_file(), settings).expect("Failed to write foreman.toml");
        fs::create_dir_all(paths.logs_dir()).expect("Failed to create logs dir");
        fs::create_dir_all(paths.workers_dir()).expect("Failed to create workers dir");
        for id in ["api", "ui", "qa"] {
            fs::write(paths.worker_prompt(id), format!("# Worker {}\n", id))
                .expect("Failed to write worker prompt");
        }

        Self {
            temp_dir,
            paths,
            sessions: Arc::new(MemorySessions::new()),
            branches: Arc::new(MemoryBranches::new()),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn load(&self) -> Project {
        Project::load(self.root()).expect("Failed to load project")
    }

    /// A monitor over the saved (or a fresh) phase state.
    pub fn context(&self) -> MonitorContext {
        let project = self.load();
        let phase = PhaseState::resume_or_start(
            &project.paths.phase_state_file(),
            &project.registry,
            &project.version(),
            || None,
        )
        .expect("Failed to start phase");
        MonitorContext::new(&project, self.sessions.clone(), self.branches.clone(), phase)
            .expect("Failed to build monitor")
    }

    pub fn write_log(&self, worker_id: &str, content: &str) {
        fs::write(self.paths.worker_log(worker_id), content).expect("Failed to write log");
    }

    pub fn write_status(&self, worker_id: &str, status: &str) {
        fs::create_dir_all(self.paths.worker_status_dir()).expect("Failed to create status dir");
        fs::write(
            self.paths.worker_status_file(worker_id),
            format!(r#"{{"status": "{}", "updated_at": "2026-03-01T12:00:00Z"}}"#, status),
        )
        .expect("Failed to write status file");
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.paths.phases_dir().join("phase-1-v1")
    }

    pub fn decisions(&self) -> String {
        fs::read_to_string(self.paths.decisions_log()).unwrap_or_default()
    }

    /// Event kinds recorded so far, oldest first.
    pub fn event_kinds(&self) -> Vec<EventKind> {
        self.load()
            .event_log()
            .read_events()
            .expect("Failed to read events")
            .into_iter()
            .map(|e| e.event_kind)
            .collect()
    }
}

/// Every file under `dir` with its bytes, keyed by relative path.
pub fn tree_contents(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in fs::read_dir(dir).expect("Failed to read dir") {
            let path = entry.expect("Failed to read entry").path();
            if path.is_dir() {
                walk(base, &path, out);
            } else {
                let rel = path.strip_prefix(base).expect("path under base").to_path_buf();
                out.insert(rel, fs::read(&path).expect("Failed to read file"));
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}
