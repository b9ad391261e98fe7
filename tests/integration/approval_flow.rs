//! Auto-approval through the monitor tick.
//!
//! These tests drive `MonitorContext::tick` against scripted screens and
//! check what was typed, what alerts were raised and what was logged.

use foreman::monitor::alerts::kind;
use foreman::monitor::{EventKind, HealthState, Severity};

use crate::fixtures::*;

/// Test: Prompt that does not go away
/// Given a worker showing a two-option prompt ending in Y/n
/// When the tick injects the affirmative option and the prompt stays
/// Then a high stuck_approval alert is recorded
#[tokio::test]
async fn test_unresolved_prompt_raises_high_alert() {
    let project = TestProject::new("any", "");
    project.sessions.set_screen("api", YES_NO_PROMPT);
    project.sessions.set_screen("ui", WORKING);
    project.sessions.set_screen("qa", WORKING);

    let mut ctx = project.context();
    ctx.tick().await.unwrap();

    assert_eq!(
        project.sessions.injections("api"),
        vec![vec!["1".to_string(), "Enter".to_string()]]
    );
    assert!(project.sessions.injections("ui").is_empty());

    let health = ctx.worker_health("api").unwrap();
    assert_eq!(health.classification.state(), HealthState::StuckApproval);

    let alerts = ctx.alerts();
    let alerts = alerts.lock().await;
    let alert = alerts.find_open("api", kind::STUCK_APPROVAL).expect("alert raised");
    assert_eq!(alert.severity, Severity::High);

    assert!(project.event_kinds().contains(&EventKind::ApprovalFailed));
    assert!(project.decisions().contains("api: state=stuck_approval"));
    assert!(project.decisions().contains("outcome=unresolved"));
}

/// Test: Prompt answered
/// Given a three-option permission prompt
/// When the injected keystroke makes the agent resume
/// Then option 2 was sent, the worker is active and no alert exists
#[tokio::test]
async fn test_resolved_prompt_selects_dynamic_option() {
    let project = TestProject::new("any", "");
    project.sessions.set_screen("api", PERMISSION_PROMPT);
    project.sessions.on_inject("api", WORKING);

    let mut ctx = project.context();
    ctx.tick().await.unwrap();

    assert_eq!(
        project.sessions.injections("api"),
        vec![vec!["2".to_string(), "Enter".to_string()]]
    );
    assert_eq!(
        ctx.worker_health("api").unwrap().classification.state(),
        HealthState::Active
    );
    let alerts = ctx.alerts();
    assert!(alerts.lock().await.open_alerts().is_empty());
    assert!(project.event_kinds().contains(&EventKind::ApprovalSucceeded));
    assert!(project.decisions().contains("outcome=resolved"));
}

/// Test: Stuck editor gets a medium alert
#[tokio::test]
async fn test_unresolved_edit_prompt_is_medium() {
    let project = TestProject::new("any", "");
    project.sessions.set_screen("ui", EDIT_PROMPT);

    let mut ctx = project.context();
    ctx.tick().await.unwrap();

    let alerts = ctx.alerts();
    let alerts = alerts.lock().await;
    let alert = alerts.find_open("ui", kind::STUCK_EDITING).expect("alert raised");
    assert_eq!(alert.severity, Severity::Medium);
}

/// Test: Cooldown
/// Given a wedged prompt and a 30s cooldown
/// When three ticks run back to back
/// Then only one injection happens and one alert exists
#[tokio::test]
async fn test_cooldown_prevents_keystroke_flooding() {
    let project = TestProject::new("any", "approval_cooldown_secs = 30\n");
    project.sessions.set_screen("api", YES_NO_PROMPT);

    let mut ctx = project.context();
    for _ in 0..3 {
        ctx.tick().await.unwrap();
    }

    assert_eq!(project.sessions.injections("api").len(), 1);
    let alerts = ctx.alerts();
    let alerts = alerts.lock().await;
    let stuck: Vec<_> = alerts
        .all()
        .iter()
        .filter(|a| a.kind == kind::STUCK_APPROVAL)
        .collect();
    assert_eq!(stuck.len(), 1);
}

/// Test: Session unreachable
/// Given injection fails
/// Then a high injection_failed alert is raised, and the next eligible
/// tick tries again once the session is back
#[tokio::test]
async fn test_injection_failure_alerts_and_retries_later() {
    let project = TestProject::new("any", "");
    project.sessions.set_screen("api", YES_NO_PROMPT);
    project.sessions.fail_inject("api", "can't find pane");

    let mut ctx = project.context();
    ctx.tick().await.unwrap();
    {
        let alerts = ctx.alerts();
        let alerts = alerts.lock().await;
        let alert = alerts.find_open("api", kind::INJECTION_FAILED).expect("alert raised");
        assert_eq!(alert.severity, Severity::High);
    }
    assert!(project.event_kinds().contains(&EventKind::InjectionFailed));

    project.sessions.heal("api");
    project.sessions.on_inject("api", WORKING);
    ctx.tick().await.unwrap();

    assert_eq!(project.sessions.injections("api").len(), 1);
    let alerts = ctx.alerts();
    assert!(alerts.lock().await.find_open("api", kind::INJECTION_FAILED).is_none());
}

/// Test: Auto-approve disabled
/// Then no keystrokes are sent and an approval_required alert is raised
#[tokio::test]
async fn test_auto_approve_off_only_alerts() {
    let project = TestProject::new("any", "auto_approve = false\n");
    project.sessions.set_screen("api", PERMISSION_PROMPT);

    let mut ctx = project.context();
    ctx.tick().await.unwrap();

    assert!(project.sessions.injections("api").is_empty());
    let alerts = ctx.alerts();
    let alerts = alerts.lock().await;
    let alert = alerts.find_open("api", kind::APPROVAL_REQUIRED).expect("alert raised");
    assert_eq!(alert.severity, Severity::High);
    assert!(project.event_kinds().contains(&EventKind::ApprovalSkipped));
}

/// Test: Numbered plan from a working agent
/// Given a worker that printed a numbered plan and kept working
/// When a tick runs
/// Then the worker is active and nothing is typed into its session
#[tokio::test]
async fn test_numbered_plan_is_not_answered() {
    let project = TestProject::new("any", "");
    project.sessions.set_screen(
        "api",
        "● I'll proceed with the following plan:\n  1. Continue refactoring the parser module\n  2. Add tests for the new grammar\n● Reading src/parser.rs\n✻ Working… (esc to interrupt)",
    );

    let mut ctx = project.context();
    ctx.tick().await.unwrap();

    let health = &ctx.worker_health("api").unwrap().classification;
    assert_eq!(health.state(), HealthState::Active);
    assert_eq!(health.rule(), Some("agent_working"));
    assert!(project.sessions.injections("api").is_empty());
    let alerts = ctx.alerts();
    assert!(alerts.lock().await.open_alerts().is_empty());
}
