//! Completion detection and archival through `check_completion`.

use chrono::{TimeZone, Utc};
use std::fs;

use foreman::monitor::alerts::{kind, PHASE_SCOPE};
use foreman::monitor::{ArchiveResult, ArchiveTrigger, EventKind, PhaseState, SignalSource};

use crate::fixtures::*;

fn t(min: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 11, min, 0).unwrap()
}

/// Test: Consensus modes disagree on partial evidence
/// Given a worker with log_marker and status_file but no branch_merged
/// Then strict mode is satisfied and all mode is not
#[tokio::test]
async fn test_strict_and_all_modes_on_partial_evidence() {
    for (mode, expected) in [("strict", true), ("all", false), ("any", true)] {
        let project = TestProject::new(mode, "");
        project.write_log("api", "building\nWORKER_COMPLETE\n");
        project.write_status("api", "done");

        let mut ctx = project.context();
        let verdict = ctx.check_completion().await.unwrap();
        let api = &verdict.per_worker["api"];
        assert_eq!(
            api.signals.iter().map(|s| s.source).collect::<Vec<_>>(),
            vec![SignalSource::LogMarker, SignalSource::StatusFile],
            "mode {}",
            mode
        );
        assert_eq!(api.satisfied, expected, "mode {}", mode);
        assert!(!verdict.complete, "ui has no signals in mode {}", mode);
    }
}

/// Test: Phase completes and archives
/// Given every non-excluded worker satisfied under any mode
/// When the completion check runs
/// Then phases/phase-1-v1/ holds the config, all logs and a summary
#[tokio::test]
async fn test_complete_phase_is_archived() {
    let project = TestProject::new("any", "");
    project.write_log("api", "WORKER_COMPLETE\n");
    project.write_log("qa", "still checking\n");
    project.branches.set_merged("feat/ui", t(5));

    let mut ctx = project.context();
    let verdict = ctx.check_completion().await.unwrap();
    assert!(verdict.complete);
    assert!(verdict.per_worker["qa"].excluded);

    let archive = project.archive_dir();
    assert!(archive.join("config/config.json").exists());
    assert!(archive.join("config/foreman.toml").exists());
    assert!(archive.join("logs/api.log").exists());
    assert!(archive.join("logs/qa.log").exists());
    assert!(archive.join("workers/api.md").exists());
    let summary = fs::read_to_string(archive.join("SUMMARY.md")).unwrap();
    assert!(summary.contains("| api |"));
    assert!(summary.contains("completion verdict"));

    let state = ctx.phase_state();
    assert!(state.complete && state.archived);
    assert_eq!(state.archive_path.as_deref(), Some(archive.as_path()));
    let saved = PhaseState::load(&project.paths.phase_state_file()).unwrap().unwrap();
    assert!(saved.archived);

    let kinds = project.event_kinds();
    assert!(kinds.contains(&EventKind::VerdictChanged));
    assert!(kinds.contains(&EventKind::ArchiveCreated));
}

/// Test: Archiving twice
/// Given an archived phase
/// When the detector and the archiver run again
/// Then the archive is byte-identical and no second directory appears
#[tokio::test]
async fn test_rearchive_is_noop() {
    let project = TestProject::new("any", "");
    project.write_log("api", "WORKER_COMPLETE\n");
    project.write_log("ui", "PHASE_COMPLETE\n");

    let mut ctx = project.context();
    ctx.check_completion().await.unwrap();
    let before = tree_contents(&project.archive_dir());

    project.write_log("api", "WORKER_COMPLETE\nmore output after the close\n");
    ctx.check_completion().await.unwrap();

    let loaded = project.load();
    let mut state = ctx.phase_state().clone();
    let verdict = ctx.check_completion().await.unwrap();
    let result = loaded
        .archiver()
        .archive(&mut state, &loaded.registry, &verdict, ArchiveTrigger::Verdict)
        .unwrap();
    assert_eq!(result, ArchiveResult::AlreadyArchived(Some(project.archive_dir())));

    // A manual close of the sealed phase is skipped and leaves a trace
    let manual = foreman::status::close_phase(&loaded, project.branches.clone()).unwrap();
    assert_eq!(manual, ArchiveResult::AlreadyArchived(Some(project.archive_dir())));
    assert!(project.event_kinds().contains(&EventKind::ArchiveSkipped));

    assert_eq!(tree_contents(&project.archive_dir()), before);
    let entries: Vec<_> = fs::read_dir(project.paths.phases_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries.len(), 1);
}

/// Test: Manual close while the monitor runs
/// Given a monitor with an incomplete phase and an open alert
/// When another process closes the phase and acknowledges the alert
/// Then the next completion check keeps the phase sealed on disk and in
/// memory, and the prompt raises a fresh alert instead of being deduplicated
#[tokio::test]
async fn test_close_phase_and_ack_while_monitor_runs() {
    let project = TestProject::new("any", "auto_approve = false\n");
    project.sessions.set_screen("api", PERMISSION_PROMPT);

    let mut ctx = project.context();
    ctx.tick().await.unwrap();
    ctx.check_completion().await.unwrap();
    let alert_id = {
        let alerts = ctx.alerts();
        let alerts = alerts.lock().await;
        alerts
            .find_open("api", kind::APPROVAL_REQUIRED)
            .expect("alert raised")
            .id
            .clone()
    };

    let loaded = project.load();
    let closed = foreman::status::close_phase(&loaded, project.branches.clone()).unwrap();
    assert_eq!(closed, ArchiveResult::Created(project.archive_dir()));
    foreman::status::acknowledge(&loaded, &alert_id).unwrap();

    let verdict = ctx.check_completion().await.unwrap();
    assert!(!verdict.complete);
    let state = ctx.phase_state();
    assert!(state.archived);
    assert_eq!(state.archive_path.as_deref(), Some(project.archive_dir().as_path()));
    let saved = PhaseState::load(&project.paths.phase_state_file()).unwrap().unwrap();
    assert!(saved.archived);

    ctx.tick().await.unwrap();
    let alerts = ctx.alerts();
    let alerts = alerts.lock().await;
    assert!(alerts.get(&alert_id).unwrap().resolved);
    let again = alerts
        .find_open("api", kind::APPROVAL_REQUIRED)
        .expect("alert raised again");
    assert_ne!(again.id, alert_id);
}

/// Test: Signals are never retracted
/// Given a merged branch observed once
/// When the branch is force-reset
/// Then the signal stays latched with its first observation time
#[tokio::test]
async fn test_signals_are_monotonic() {
    let project = TestProject::new("any", "");
    project.branches.set_merged("feat/api", t(1));

    let mut ctx = project.context();
    let first = ctx.check_completion().await.unwrap();
    assert!(first.per_worker["api"].satisfied);

    project.branches.unmerge("feat/api");
    let second = ctx.check_completion().await.unwrap();
    assert!(second.per_worker["api"].satisfied);
    let latched = &ctx.phase_state().workers["api"].signals;
    assert_eq!(latched.len(), 1);
    assert_eq!(latched[0].observed_at, t(1));

    project.branches.set_merged("feat/api", t(30));
    ctx.check_completion().await.unwrap();
    assert_eq!(ctx.phase_state().workers["api"].signals[0].observed_at, t(1));

    let observed = project
        .event_kinds()
        .into_iter()
        .filter(|k| *k == EventKind::SignalObserved)
        .count();
    assert_eq!(observed, 1);
}

/// Test: Events-file marker
/// Given a COMPLETE-style record for a worker in logs/events.jsonl
/// Then it counts as that worker's log_marker signal
#[tokio::test]
async fn test_events_file_marker_counts_as_log_marker() {
    let project = TestProject::new("any", "");
    fs::write(
        project.paths.worker_events_file(),
        "{\"event\": \"COMMIT\", \"worker\": \"ui\", \"timestamp\": \"2026-03-01T10:00:00\"}\n\
         {\"event\": \"WORKER_COMPLETE\", \"source\": \"ui\", \"timestamp\": \"2026-03-01T11:00:00Z\"}\n",
    )
    .unwrap();

    let mut ctx = project.context();
    let verdict = ctx.check_completion().await.unwrap();
    let ui = &verdict.per_worker["ui"];
    assert!(ui.satisfied);
    assert_eq!(ui.signals[0].source, SignalSource::LogMarker);
    assert_eq!(ui.signals[0].observed_at, t(0));
    assert!(!verdict.per_worker["api"].satisfied);
}

/// Test: Silent worker past the signal timeout
/// Then a high no_completion_signal alert is raised for it, not for
/// excluded workers, and it resolves once a signal appears
#[tokio::test]
async fn test_signal_timeout_alerts_silent_workers() {
    let project = TestProject::new("any", "signal_timeout_secs = 0\n");
    project.write_log("api", "WORKER_COMPLETE\n");

    let mut ctx = project.context();
    ctx.check_completion().await.unwrap();
    {
        let alerts = ctx.alerts();
        let alerts = alerts.lock().await;
        assert!(alerts.find_open("ui", kind::NO_COMPLETION_SIGNAL).is_some());
        assert!(alerts.find_open("api", kind::NO_COMPLETION_SIGNAL).is_none());
        assert!(alerts.find_open("qa", kind::NO_COMPLETION_SIGNAL).is_none());
    }

    project.write_status("ui", "complete");
    ctx.check_completion().await.unwrap();
    let alerts = ctx.alerts();
    assert!(alerts.lock().await.find_open("ui", kind::NO_COMPLETION_SIGNAL).is_none());
}

/// Test: Archive failure escalates
/// Given the config snapshot cannot be copied
/// When the completion check keeps failing to archive
/// Then nothing appears under phases/, and after the retry budget an
/// archive_failed alert is raised and retries stop
#[tokio::test]
async fn test_archive_failure_escalates_after_retries() {
    let project = TestProject::new("any", "max_archive_retries = 2\n");
    project.write_log("api", "WORKER_COMPLETE\n");
    project.write_log("ui", "WORKER_COMPLETE\n");

    let mut ctx = project.context();
    fs::remove_file(project.paths.config_file()).unwrap();

    for _ in 0..3 {
        ctx.check_completion().await.unwrap();
    }

    let state = ctx.phase_state();
    assert!(state.complete);
    assert!(!state.archived);
    assert_eq!(state.archive_attempts, 2);
    assert!(state.archive_escalated);
    assert!(!project.archive_dir().exists());
    let leftovers = fs::read_dir(project.paths.phases_dir())
        .map(|d| d.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);

    let alerts = ctx.alerts();
    assert!(alerts
        .lock()
        .await
        .find_open(PHASE_SCOPE, kind::ARCHIVE_FAILED)
        .is_some());
    let failures = project
        .event_kinds()
        .into_iter()
        .filter(|k| *k == EventKind::ArchiveFailed)
        .count();
    assert_eq!(failures, 2);
}
