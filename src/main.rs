use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use foreman::config::{ProjectPaths, DEFAULT_PROJECT_DIR};
use foreman::git::{current_base_commit, open_branch_status};
use foreman::monitor::{ArchiveResult, PhaseState};
use foreman::session::TmuxSessions;
use foreman::status::{self, StatusReport};
use foreman::tmux::Tmux;
use foreman::util::expand_tilde;
use foreman::{flog, flog_error, flog_warn, MonitorContext, Project, Result};

/// Foreman - supervises a phase of parallel coding agents running in tmux
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1     Enable debug logging (alternative to --debug)\n\nEXIT CODES:\n    0  phase complete / success\n    1  phase incomplete\n    2  error (invalid config, unreadable state)")]
pub struct Cli {
    /// Project directory holding config.json and foreman.toml
    #[arg(short = 'p', long, default_value = DEFAULT_PROJECT_DIR)]
    pub project_dir: String,

    /// Git repository the worker branches live in
    #[arg(short = 'r', long, default_value = ".")]
    pub repo: String,

    /// Enable debug logging (writes to <project-dir>/status/foreman.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the monitoring loop in the foreground
    Run {
        /// Do not echo log lines to stderr
        #[arg(long, short = 'q')]
        quiet: bool,
    },

    /// Ask a running monitor to stop after its current tick
    Stop,

    /// Show phase, worker health and open alerts
    Status {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Exit 0 if the active phase is complete, 1 if not
    Check,

    /// Archive the active phase now, regardless of the verdict
    ClosePhase,

    /// Acknowledge (resolve) an alert by id or id prefix
    Ack {
        /// Alert id
        alert_id: String,
    },

    /// Validate config.json and foreman.toml
    Validate,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let root = expand_tilde(&cli.project_dir);
    let repo = expand_tilde(&cli.repo);

    let echo = matches!(cli.command, Command::Run { quiet: false });
    foreman::log::init(&ProjectPaths::new(&root).diagnostic_log(), cli.debug, echo);

    let result = match cli.command {
        Command::Run { .. } => run_monitor(&root, &repo),
        Command::Stop => run_stop(&root),
        Command::Status { json } => run_status(&root, &repo, json),
        Command::Check => run_check(&root, &repo),
        Command::ClosePhase => run_close_phase(&root, &repo),
        Command::Ack { alert_id } => run_ack(&root, &alert_id),
        Command::Validate => run_validate(&root),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            flog_error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}

fn run_monitor(root: &Path, repo: &Path) -> Result<u8> {
    let project = Project::load(root)?;
    let session = project.session_name();
    flog!(
        "foreman starting: project={} phase={} session={} repo={}",
        project.config.project.name,
        project.registry.active_phase(),
        session,
        repo.display()
    );

    if !Tmux::is_available() {
        flog_warn!("tmux not found on PATH; every capture will fail");
    } else if !Tmux::session_exists(&session) {
        flog_warn!("tmux session '{}' does not exist yet", session);
    } else {
        if let Ok(version) = Tmux::version() {
            flog!("Using {}", version);
        }
        let windows = Tmux::list_windows(&session)?;
        for worker in project.registry.workers_in_phase(project.registry.active_phase()) {
            let expected = (worker.index + 1) as u32;
            if worker.tmux_target.is_none() && !windows.contains(&expected) {
                flog_warn!("worker '{}': window {} not found in '{}'", worker.id, expected, session);
            }
        }
    }

    let base_branch = project.settings.base_branch.clone();
    let phase = PhaseState::resume_or_start(
        &project.paths.phase_state_file(),
        &project.registry,
        &project.version(),
        || current_base_commit(repo, &base_branch),
    )?;
    let branches = open_branch_status(repo, &base_branch, phase.base_commit.as_deref());
    let sessions = Arc::new(TmuxSessions::new(&session, &project.registry));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut ctx = MonitorContext::new(&project, sessions, branches, phase)?;
        ctx.watch_logs();

        let cancel = ctx.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flog!("Interrupted, shutting down");
                cancel.cancel();
            }
        });

        ctx.run().await
    })?;
    Ok(0)
}

fn run_stop(root: &Path) -> Result<u8> {
    let path = status::request_stop(&ProjectPaths::new(root))?;
    println!("Stop requested ({})", path.display());
    Ok(0)
}

fn load_report(root: &Path, repo: &Path) -> Result<StatusReport> {
    let project = Project::load(root)?;
    let state = status::current_phase_state(&project)?;
    let branches = open_branch_status(repo, &project.settings.base_branch, state.base_commit.as_deref());
    StatusReport::build(&project, branches)
}

fn run_status(root: &Path, repo: &Path, json: bool) -> Result<u8> {
    let report = load_report(root, repo)?;
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render());
    }
    Ok(report.exit_code())
}

fn run_check(root: &Path, repo: &Path) -> Result<u8> {
    let report = load_report(root, repo)?;
    let code = report.exit_code();
    println!(
        "phase {}: {}",
        report.phase,
        if code == 0 { "complete" } else { "incomplete" }
    );
    Ok(code)
}

fn run_close_phase(root: &Path, repo: &Path) -> Result<u8> {
    let project = Project::load(root)?;
    let state = status::current_phase_state(&project)?;
    let branches = open_branch_status(repo, &project.settings.base_branch, state.base_commit.as_deref());
    match status::close_phase(&project, branches)? {
        ArchiveResult::Created(path) => println!("Phase {} archived to {}", state.phase, path.display()),
        ArchiveResult::AlreadyArchived(path) => {
            let shown = path.map(|p: PathBuf| p.display().to_string()).unwrap_or_default();
            println!("Phase {} was already archived {}", state.phase, shown);
        }
    }
    Ok(0)
}

fn run_ack(root: &Path, alert_id: &str) -> Result<u8> {
    let project = Project::load(root)?;
    let alert = status::acknowledge(&project, alert_id)?;
    println!("Acknowledged {} ({} {})", alert.id, alert.worker_id, alert.kind);
    Ok(0)
}

fn run_validate(root: &Path) -> Result<u8> {
    let project = Project::load(root)?;
    let phase = project.registry.active_phase();
    println!(
        "{}: valid ({} workers, {} in phase {}, {} mode)",
        project.paths.config_file().display(),
        project.registry.workers().len(),
        project.registry.workers_in_phase(phase).len(),
        phase,
        project.registry.mode()
    );
    Ok(0)
}
