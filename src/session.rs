//! Session capability: read a worker's terminal and type into it.
//!
//! The monitor only ever talks to a `SessionBackend`. `TmuxSessions` binds it
//! to tmux windows; `MemorySessions` is an in-memory stand-in with scripted
//! screens, used by the test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::registry::Registry;
use crate::tmux::Tmux;
use crate::{Error, Result};

/// Both calls are blocking; the monitor runs them on the blocking pool with
/// a deadline.
pub trait SessionBackend: Send + Sync {
    /// Return the last `lines` lines of the worker's terminal.
    fn capture(&self, worker_id: &str, lines: u16) -> Result<String>;

    /// Type `keys` (tmux key names) into the worker's terminal.
    fn inject(&self, worker_id: &str, keys: &[String]) -> Result<()>;
}

/// Workers mapped onto windows of one tmux session.
pub struct TmuxSessions {
    targets: HashMap<String, String>,
}

impl TmuxSessions {
    pub fn new(session: &str, registry: &Registry) -> Self {
        let targets = registry
            .workers()
            .iter()
            .map(|w| {
                let target = w
                    .tmux_target
                    .clone()
                    .unwrap_or_else(|| Tmux::worker_target(session, w.index));
                (w.id.clone(), target)
            })
            .collect();
        Self { targets }
    }

    pub fn target(&self, worker_id: &str) -> Result<&str> {
        self.targets
            .get(worker_id)
            .map(String::as_str)
            .ok_or_else(|| Error::WorkerNotFound(worker_id.to_string()))
    }
}

impl SessionBackend for TmuxSessions {
    fn capture(&self, worker_id: &str, lines: u16) -> Result<String> {
        Tmux::capture_pane_tail(self.target(worker_id)?, lines)
    }

    fn inject(&self, worker_id: &str, keys: &[String]) -> Result<()> {
        Tmux::send_keys(self.target(worker_id)?, keys)
    }
}

#[derive(Default)]
struct MemoryPane {
    screen: String,
    after_inject: VecDeque<String>,
    capture_delay: Option<Duration>,
    capture_error: Option<String>,
    inject_error: Option<String>,
    captures: usize,
    injections: Vec<(Instant, Vec<String>)>,
}

/// In-memory sessions with scripted screens.
///
/// Each worker has a current screen. Screens queued with `on_inject` replace
/// it one at a time as injections arrive, which is how a test simulates an
/// agent reacting to a keystroke.
#[derive(Default)]
pub struct MemorySessions {
    panes: Mutex<HashMap<String, MemoryPane>>,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_pane<R>(&self, worker_id: &str, f: impl FnOnce(&mut MemoryPane) -> R) -> R {
        let mut panes = self.panes.lock().unwrap_or_else(|e| e.into_inner());
        f(panes.entry(worker_id.to_string()).or_default())
    }

    pub fn set_screen(&self, worker_id: &str, screen: &str) {
        self.with_pane(worker_id, |p| p.screen = screen.to_string());
    }

    /// Queue the screen shown after the next injection.
    pub fn on_inject(&self, worker_id: &str, screen: &str) {
        self.with_pane(worker_id, |p| p.after_inject.push_back(screen.to_string()));
    }

    /// Make every capture of this worker block for `delay`.
    pub fn hang_capture(&self, worker_id: &str, delay: Duration) {
        self.with_pane(worker_id, |p| p.capture_delay = Some(delay));
    }

    pub fn fail_capture(&self, worker_id: &str, message: &str) {
        self.with_pane(worker_id, |p| p.capture_error = Some(message.to_string()));
    }

    pub fn fail_inject(&self, worker_id: &str, message: &str) {
        self.with_pane(worker_id, |p| p.inject_error = Some(message.to_string()));
    }

    pub fn heal(&self, worker_id: &str) {
        self.with_pane(worker_id, |p| {
            p.capture_delay = None;
            p.capture_error = None;
            p.inject_error = None;
        });
    }

    pub fn capture_count(&self, worker_id: &str) -> usize {
        self.with_pane(worker_id, |p| p.captures)
    }

    pub fn injections(&self, worker_id: &str) -> Vec<Vec<String>> {
        self.with_pane(worker_id, |p| p.injections.iter().map(|(_, k)| k.clone()).collect())
    }

    pub fn injection_times(&self, worker_id: &str) -> Vec<Instant> {
        self.with_pane(worker_id, |p| p.injections.iter().map(|(t, _)| *t).collect())
    }
}

impl SessionBackend for MemorySessions {
    fn capture(&self, worker_id: &str, lines: u16) -> Result<String> {
        let (delay, result) = self.with_pane(worker_id, |p| {
            p.captures += 1;
            let result = match &p.capture_error {
                Some(msg) => Err(Error::Tmux(msg.clone())),
                None => Ok(tail(&p.screen, lines as usize)),
            };
            (p.capture_delay, result)
        });
        // Sleep outside the lock so other workers stay capturable
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        result
    }

    fn inject(&self, worker_id: &str, keys: &[String]) -> Result<()> {
        self.with_pane(worker_id, |p| {
            if let Some(msg) = &p.inject_error {
                return Err(Error::Tmux(msg.clone()));
            }
            p.injections.push((Instant::now(), keys.to_vec()));
            if let Some(next) = p.after_inject.pop_front() {
                p.screen = next;
            }
            Ok(())
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
