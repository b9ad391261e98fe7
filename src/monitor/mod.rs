//! The monitoring core: classification, approval, completion and archival,
//! tied together by the daemon loop.

pub mod activity;
pub mod alerts;
pub mod approval;
pub mod archive;
pub mod classifier;
pub mod completion;
pub mod daemon;
pub mod events;
pub mod phase;

pub use alerts::{Alert, AlertLog, Severity};
pub use approval::{ApprovalEngine, ApprovalSettings, Resolution};
pub use archive::{ArchiveResult, ArchiveTrigger, Archiver};
pub use classifier::{Classification, Classifier, HealthState, SuggestedAction};
pub use completion::{CompletionDetector, CompletionSignal, PhaseVerdict, SignalCollector, SignalSource};
pub use daemon::{MonitorContext, MonitorSnapshot, WorkerHealth};
pub use events::{EventKind, EventLog};
pub use phase::PhaseState;

use std::path::Path;
use std::sync::Arc;

use crate::config::{MonitorSettings, ProjectConfig, ProjectPaths};
use crate::flog_debug;
use crate::registry::Registry;
use crate::Result;

/// A loaded and validated project directory.
#[derive(Debug, Clone)]
pub struct Project {
    pub paths: ProjectPaths,
    pub config: ProjectConfig,
    pub settings: MonitorSettings,
    pub registry: Arc<Registry>,
}

impl Project {
    /// Load `config.json` and `foreman.toml` from `root` and validate the
    /// worker registry. Any problem is fatal.
    pub fn load(root: &Path) -> Result<Self> {
        let paths = ProjectPaths::new(root);
        let config = ProjectConfig::load(&paths.config_file())?;
        let settings = MonitorSettings::load(&paths.settings_file())?;
        let registry = Registry::load(&config)?;
        flog_debug!(
            "Project::load {} phase={} workers={}",
            config.project.name,
            registry.active_phase(),
            registry.workers().len()
        );
        Ok(Self {
            paths,
            config,
            settings,
            registry: Arc::new(registry),
        })
    }

    pub fn version(&self) -> String {
        self.config.version_tag()
    }

    pub fn session_name(&self) -> String {
        self.settings.session_name(&self.config)
    }

    pub fn archiver(&self) -> Archiver {
        Archiver::new(self.paths.clone(), self.settings.clone())
    }

    pub fn event_log(&self) -> EventLog {
        EventLog::new(&self.paths.event_log_file(), &self.paths.decisions_log())
    }
}
