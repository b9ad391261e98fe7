//! Monitoring loop behavior: isolation of per-worker failures, shutdown and
//! restart.

use std::fs;
use std::time::{Duration, Instant, SystemTime};

use foreman::monitor::alerts::kind;
use foreman::monitor::{Classifier, EventKind, HealthState, MonitorSnapshot};

use crate::fixtures::*;

/// Test: One hung capture
/// Given a worker whose capture blocks far past the check timeout
/// When a tick runs
/// Then that worker is unknown, the others are classified in the same
/// tick, and the tick finishes close to the timeout
#[tokio::test]
async fn test_capture_timeout_degrades_only_that_worker() {
    let project = TestProject::new("any", "");
    project.sessions.set_screen("api", WORKING);
    project.sessions.hang_capture("api", Duration::from_secs(1));
    project.sessions.set_screen("ui", "$ ");
    project.sessions.fail_capture("qa", "can't find window: 3");

    let mut ctx = project.context();
    let started = Instant::now();
    ctx.tick().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(900));

    let api = &ctx.worker_health("api").unwrap().classification;
    assert_eq!(api.state(), HealthState::Unknown);
    assert_eq!(api.rule(), Some("capture_failed"));
    assert_eq!(
        ctx.worker_health("qa").unwrap().classification.state(),
        HealthState::Unknown
    );
    assert_eq!(
        ctx.worker_health("ui").unwrap().classification.state(),
        HealthState::Idle
    );
    assert!(ctx.last_tick().is_some());

    let failures = project
        .event_kinds()
        .into_iter()
        .filter(|k| *k == EventKind::CaptureFailed)
        .count();
    assert_eq!(failures, 2);
}

/// Test: Health only comes from the classifier
/// For a series of screens, the state the loop stores equals what a
/// fresh classifier returns for the same text
#[tokio::test]
async fn test_stored_health_matches_classifier() {
    let project = TestProject::new("any", "auto_approve = false\n");
    let loaded = project.load();
    let classifier = Classifier::new(
        &loaded.settings.completion_markers,
        loaded.settings.prompt_window_lines,
        loaded.settings.idle_threshold(),
    )
    .unwrap();

    let screens = [
        WORKING,
        YES_NO_PROMPT,
        EDIT_PROMPT,
        "Error: rate limit exceeded, retrying in 30s",
        "error: could not compile `foreman`",
        "> ",
        "",
        "tests passed\nWORKER_COMPLETE",
    ];
    let mut ctx = project.context();
    for screen in screens {
        project.sessions.set_screen("ui", screen);
        ctx.tick().await.unwrap();
        let stored = &ctx.worker_health("ui").unwrap().classification;
        assert_eq!(*stored, classifier.classify("ui", screen, Duration::ZERO), "screen {:?}", screen);
    }
    assert_eq!(
        ctx.worker_health("ui").unwrap().classification.state(),
        HealthState::Complete
    );
}

/// Test: Complete workers are skipped
#[tokio::test]
async fn test_complete_worker_not_captured_again() {
    let project = TestProject::new("any", "");
    project.sessions.set_screen("api", "all done\nWORKER_COMPLETE");

    let mut ctx = project.context();
    ctx.tick().await.unwrap();
    ctx.tick().await.unwrap();
    assert_eq!(project.sessions.capture_count("api"), 1);
}

/// Test: Repeatedly stuck
/// Given a prompt that keeps coming back for three ticks
/// Then one high repeatedly_stuck alert is raised
#[tokio::test]
async fn test_repeatedly_stuck_escalates() {
    let project = TestProject::new("any", "stuck_escalation_ticks = 3\n");
    project.sessions.set_screen("api", YES_NO_PROMPT);

    let mut ctx = project.context();
    for _ in 0..5 {
        ctx.tick().await.unwrap();
    }
    let alerts = ctx.alerts();
    let alerts = alerts.lock().await;
    let repeated: Vec<_> = alerts
        .all()
        .iter()
        .filter(|a| a.kind == kind::REPEATEDLY_STUCK)
        .collect();
    assert_eq!(repeated.len(), 1);
    assert!(!repeated[0].resolved);
}

/// Test: Stop request
/// Given a STOP file written while the loop runs
/// Then run() returns and the stop is logged
#[tokio::test]
async fn test_stop_file_ends_run() {
    let project = TestProject::new("any", "");
    project.sessions.set_screen("api", WORKING);

    let mut ctx = project.context();
    foreman::status::request_stop(&project.paths).unwrap();

    tokio::time::timeout(Duration::from_secs(5), ctx.run())
        .await
        .expect("run should stop")
        .unwrap();

    assert!(!project.paths.stop_file().exists());
    let kinds = project.event_kinds();
    assert_eq!(kinds.first(), Some(&EventKind::MonitorStarted));
    assert_eq!(kinds.last(), Some(&EventKind::MonitorStopped));
}

/// Test: Cancellation
/// Given a running loop
/// When the cancel token fires
/// Then run() returns within the grace period and state is on disk
#[tokio::test]
async fn test_cancel_stops_run_gracefully() {
    let project = TestProject::new("any", "");
    project.sessions.set_screen("api", WORKING);

    let mut ctx = project.context();
    let cancel = ctx.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), ctx.run())
        .await
        .expect("run should stop")
        .unwrap();

    let snapshot = MonitorSnapshot::load(&project.paths.monitor_state_file())
        .unwrap()
        .expect("snapshot written");
    assert_eq!(snapshot.workers["api"].health, HealthState::Active);
    assert!(project.paths.phase_state_file().exists());
}

/// Test: Restart
/// Given a monitor that latched a signal and raised an alert
/// When a new monitor starts on the same directory after the evidence is gone
/// Then the signal, the alert and the activity timestamps survive
#[tokio::test]
async fn test_restart_resumes_state() {
    let project = TestProject::new("any", "auto_approve = false\n");
    project.sessions.set_screen("api", WORKING);
    project.sessions.set_screen("ui", PERMISSION_PROMPT);
    project.write_log("api", "WORKER_COMPLETE\n");

    let (alert_id, api_activity) = {
        let mut ctx = project.context();
        ctx.tick().await.unwrap();
        ctx.check_completion().await.unwrap();
        let alerts = ctx.alerts();
        let alert_id = alerts
            .lock()
            .await
            .find_open("ui", kind::APPROVAL_REQUIRED)
            .expect("alert raised")
            .id
            .clone();
        (alert_id, ctx.worker_health("api").unwrap().last_activity)
    };
    assert!(api_activity.is_some());

    fs::remove_file(project.paths.worker_log("api")).unwrap();

    let mut ctx = project.context();
    assert_eq!(ctx.phase_state().workers["api"].signals.len(), 1);
    assert_eq!(ctx.worker_health("api").unwrap().last_activity, api_activity);
    {
        let alerts = ctx.alerts();
        let alerts = alerts.lock().await;
        assert!(!alerts.get(&alert_id).unwrap().resolved);
    }

    // Unchanged screen after restart is not new activity
    ctx.tick().await.unwrap();
    assert_eq!(ctx.worker_health("api").unwrap().last_activity, api_activity);

    let verdict = ctx.check_completion().await.unwrap();
    assert!(verdict.per_worker["api"].satisfied);
}

/// Test: Log activity
/// Given a worker whose screen is unchanged but whose log keeps growing
/// Then the log modification time is used as its last activity
#[tokio::test]
async fn test_log_writes_count_as_activity() {
    let project = TestProject::new("any", "");
    project.sessions.set_screen("ui", WORKING);

    let mut ctx = project.context();
    ctx.tick().await.unwrap();
    let first = ctx.worker_health("ui").unwrap().last_activity.unwrap();

    project.write_log("ui", "step 2\n");
    // Push the mtime clear of the first tick regardless of timestamp granularity
    fs::File::options()
        .write(true)
        .open(project.paths.worker_log("ui"))
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
    ctx.tick().await.unwrap();
    let second = ctx.worker_health("ui").unwrap().last_activity.unwrap();
    assert!(second > first);
}
