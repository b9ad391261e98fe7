use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Archive of phase {phase} failed: {reason}")]
    Archive { phase: u32, reason: String },

    #[error("Archive of phase {phase} failed after {attempts} attempts, manual intervention required")]
    ArchiveEscalated { phase: u32, attempts: u32 },

    #[error("State error: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, Error>;
