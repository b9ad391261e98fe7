pub mod config;
pub mod error;
pub mod git;
pub mod log;
pub mod registry;
pub mod session;
pub mod status;
pub mod tmux;
pub mod util;

// Monitoring core
pub mod monitor;

pub use error::{Error, Result};
pub use monitor::{MonitorContext, Project};
pub use registry::{ConsensusMode, Registry, Worker};
