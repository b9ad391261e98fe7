//! Worker activity from log files.
//!
//! Workers append to `logs/<id>.log` and to the shared `logs/events.jsonl`.
//! A file watcher turns those writes into last-activity timestamps; file
//! modification times are also polled each tick in case a watch event is
//! missed (network filesystems, a watcher that failed to start).

use chrono::{DateTime, Utc};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::ProjectPaths;
use crate::{flog_debug, flog_warn, Result};

type Seen = Arc<Mutex<HashMap<String, DateTime<Utc>>>>;

pub struct ActivityTracker {
    paths: ProjectPaths,
    worker_ids: HashSet<String>,
    seen: Seen,
    _watcher: Option<RecommendedWatcher>,
}

/// Map a changed file under `logs/` to the worker it belongs to.
pub fn worker_for_log(path: &Path, worker_ids: &HashSet<String>) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("log") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    worker_ids.contains(stem).then(|| stem.to_string())
}

/// Worker named by one `events.jsonl` record (`worker`, else `source`).
pub fn worker_for_event_line(line: &str, worker_ids: &HashSet<String>) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let id = value
        .get("worker")
        .or_else(|| value.get("source"))
        .and_then(|v| v.as_str())?;
    worker_ids.contains(id).then(|| id.to_string())
}

/// Last line of a file, reading at most the final 8 KiB.
fn last_line(path: &Path) -> Option<String> {
    let mut file = fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let start = len.saturating_sub(8192);
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut tail = String::new();
    file.read_to_string(&mut tail).ok()?;
    tail.lines().rev().find(|l| !l.trim().is_empty()).map(str::to_string)
}

fn bump(seen: &Seen, worker_id: String, at: DateTime<Utc>) {
    let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
    let entry = seen.entry(worker_id).or_insert(at);
    if at > *entry {
        *entry = at;
    }
}

impl ActivityTracker {
    /// Track activity without a watcher; only the per-tick poll runs.
    pub fn polling(paths: ProjectPaths, worker_ids: HashSet<String>) -> Self {
        Self {
            paths,
            worker_ids,
            seen: Arc::new(Mutex::new(HashMap::new())),
            _watcher: None,
        }
    }

    /// Watch `logs/`. Falls back to polling when the watcher cannot start.
    pub fn watch(paths: ProjectPaths, worker_ids: HashSet<String>) -> Self {
        let mut tracker = Self::polling(paths, worker_ids);
        match tracker.start_watcher() {
            Ok(watcher) => tracker._watcher = Some(watcher),
            Err(e) => flog_warn!("Log watcher unavailable, polling only: {}", e),
        }
        tracker
    }

    fn start_watcher(&self) -> Result<RecommendedWatcher> {
        let logs_dir = self.paths.logs_dir();
        fs::create_dir_all(&logs_dir)?;
        let events_file: PathBuf = self.paths.worker_events_file();
        let ids = self.worker_ids.clone();
        let seen = self.seen.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Ok(event) = res else {
                    return;
                };
                match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) => {}
                    _ => return,
                }
                let now = Utc::now();
                for path in event.paths {
                    if path.file_name() == events_file.file_name() {
                        if let Some(id) = last_line(&path).and_then(|l| worker_for_event_line(&l, &ids)) {
                            bump(&seen, id, now);
                        }
                    } else if let Some(id) = worker_for_log(&path, &ids) {
                        bump(&seen, id, now);
                    }
                }
            },
            Config::default(),
        )?;
        watcher.watch(&logs_dir, RecursiveMode::NonRecursive)?;
        flog_debug!("Watching {} for worker activity", logs_dir.display());
        Ok(watcher)
    }

    /// Fold log file modification times into the activity map.
    pub fn poll(&self) {
        for id in &self.worker_ids {
            let log = self.paths.worker_log(id);
            if let Some(at) = fs::metadata(&log)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from)
            {
                bump(&self.seen, id.clone(), at);
            }
        }
    }

    pub fn last_seen(&self, worker_id: &str) -> Option<DateTime<Utc>> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker_id)
            .copied()
    }
}
