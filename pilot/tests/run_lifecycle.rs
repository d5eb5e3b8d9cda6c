//! Run-level lifecycle tests.
//!
//! These drive a [`RunController`] end to end against scripted collaborators
//! and check the observable contract: final status, event order, history,
//! and that the driver session is released exactly once per attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pilot::controller::{RunController, RunRequest, RunSettings};
use pilot::core::decision::ActionKind;
use pilot::core::event::RunEvent;
use pilot::core::intent::ToolCall;
use pilot::core::status::RunStatus;
use pilot::io::oracle::Verdict;
use pilot::router::EMPTY_GOAL_REPLY;
use pilot::test_support::{
    DriverCall, Fixture, ScriptedDriver, ScriptedOracle, decision, drain_events, kinds, tap_at,
    type_text,
};

const STOP_FRAME: &str = r#"{"type": "user_message", "message": "stop"}"#;

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

fn controller(fixture: &Fixture, settings: RunSettings) -> Arc<RunController> {
    RunController::new(
        RunRequest {
            app: "app.apk".into(),
            goal: "Log in with test/1234".into(),
        },
        fixture.driver.clone(),
        fixture.oracle.clone(),
        settings,
    )
}

async fn wait_for_status(run: &RunController, status: RunStatus) {
    let mut rx = run.watch_status();
    within(rx.wait_for(|current| *current == status))
        .await
        .map(|_| ())
        .expect("status channel closed");
}

/// Wait until the oracle has analyzed at least `n` screens.
async fn wait_for_analyses(fixture: &Fixture, n: usize) {
    within(async {
        while fixture.oracle.analyze_calls() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

fn complete_status(events: &[RunEvent]) -> Option<RunStatus> {
    events.iter().rev().find_map(|event| match event {
        RunEvent::Complete { status, .. } => Some(*status),
        _ => None,
    })
}

fn chat_messages(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            RunEvent::ChatResponse { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Three steps, each an action followed by the oracle confirming the step.
#[tokio::test]
async fn three_step_plan_completes() {
    let fixture = Fixture::new(
        ScriptedDriver::new(),
        ScriptedOracle::new()
            .with_plan(&["Tap username", "Type password", "Tap login"])
            .with_decisions([
                tap_at(100, 200),
                decision(ActionKind::Done),
                type_text("1234"),
                decision(ActionKind::Done),
                tap_at(300, 400),
                decision(ActionKind::Done),
            ]),
    );
    let run = controller(&fixture, RunSettings::default());
    let mut rx = run.subscribe();

    let status = within(run.clone().start()).await;
    let events = drain_events(&mut rx);

    assert_eq!(status, RunStatus::Completed);
    assert_eq!(complete_status(&events), Some(RunStatus::Completed));
    let completed_steps = events
        .iter()
        .filter(|event| matches!(event, RunEvent::TaskComplete { .. }))
        .count();
    assert_eq!(completed_steps, 3);
    assert!(!kinds(&events).contains(&"warning"), "no retries expected");
    assert_eq!(fixture.driver.actions().len(), 3);
    assert_eq!(fixture.driver.quit_count(), 1);

    let history = run.history();
    let task_completions = history
        .iter()
        .filter(|entry| entry.action.as_deref() == Some("task_complete"))
        .count();
    assert_eq!(task_completions, 3);
}

#[tokio::test]
async fn repeated_action_failures_fail_the_run() {
    let fixture = Fixture::new(
        ScriptedDriver::new().with_action_results([
            Err("gesture rejected".to_string()),
            Err("gesture rejected".to_string()),
            Err("gesture rejected".to_string()),
        ]),
        ScriptedOracle::new()
            .with_plan(&["Tap login"])
            .with_decisions([tap_at(1, 1), tap_at(1, 1), tap_at(1, 1)]),
    );
    let run = controller(&fixture, RunSettings::default());
    let mut rx = run.subscribe();

    let status = within(run.clone().start()).await;
    let events = drain_events(&mut rx);

    assert_eq!(status, RunStatus::Failed);
    let errors: Vec<&RunEvent> = events
        .iter()
        .filter(|event| matches!(event, RunEvent::Error { .. }))
        .collect();
    assert_eq!(
        errors,
        vec![&RunEvent::error("Action 'tap' failed after 3 attempts")]
    );
    let warnings = kinds(&events).iter().filter(|kind| **kind == "warning").count();
    assert_eq!(warnings, 2);
    assert!(
        !kinds(&events).contains(&"task_complete"),
        "step index must not move"
    );
    assert_eq!(fixture.driver.quit_count(), 1);
}

#[tokio::test]
async fn stop_message_stops_the_run() {
    let fixture = Fixture::new(
        ScriptedDriver::new(),
        ScriptedOracle::new().with_intents([Ok(ToolCall::StopAgent)]),
    );
    let run = controller(&fixture, RunSettings::default());
    let mut rx = run.subscribe();
    run.launch();
    wait_for_analyses(&fixture, 1).await;

    let call = run.handle_user_input(STOP_FRAME).await.expect("valid frame");
    assert_eq!(call, ToolCall::StopAgent);
    assert_eq!(run.status(), RunStatus::Stopped);
    assert!(run.should_stop());

    assert_eq!(within(run.wait()).await, RunStatus::Stopped);
    let events = drain_events(&mut rx);
    assert_eq!(complete_status(&events), Some(RunStatus::Stopped));
    assert!(chat_messages(&events).contains(&"Stopping the agent.".to_string()));
    assert_eq!(fixture.driver.quit_count(), 1);
}

#[tokio::test]
async fn empty_goal_update_is_rejected() {
    let fixture = Fixture::new(
        ScriptedDriver::new(),
        ScriptedOracle::new().with_intents([Ok(ToolCall::UpdateGoal {
            new_goal: "   ".into(),
        })]),
    );
    let run = controller(&fixture, RunSettings::default());
    let mut rx = run.subscribe();
    run.launch();
    wait_for_analyses(&fixture, 1).await;

    run.handle_message("change the goal").await;

    assert_eq!(run.goal(), "Log in with test/1234");
    assert_eq!(run.status(), RunStatus::Running);
    run.stop();
    within(run.wait()).await;

    let events = drain_events(&mut rx);
    assert!(chat_messages(&events).contains(&EMPTY_GOAL_REPLY.to_string()));
    assert_eq!(complete_status(&events), Some(RunStatus::Stopped));
    assert_eq!(fixture.oracle.plan_calls(), 1, "no restart may happen");
    assert_eq!(fixture.driver.quit_count(), 1);
}

#[tokio::test]
async fn setup_failure_skips_execution() {
    let fixture = Fixture::new(
        ScriptedDriver::new().failing_start("emulator offline"),
        ScriptedOracle::new(),
    );
    let run = controller(&fixture, RunSettings::default());
    let mut rx = run.subscribe();

    let status = within(run.clone().start()).await;
    let events = drain_events(&mut rx);

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(kinds(&events), vec!["status", "error", "complete"]);
    let RunEvent::Error { message } = &events[1] else {
        panic!("expected error event, got {:?}", events[1]);
    };
    assert!(message.starts_with("Setup failed"), "{message}");
    assert_eq!(fixture.oracle.plan_calls(), 0);
    assert_eq!(fixture.driver.count(|call| *call == DriverCall::Screenshot), 0);
    assert_eq!(fixture.driver.quit_count(), 1);
}

#[tokio::test]
async fn malformed_frame_reports_error_and_keeps_running() {
    let fixture = Fixture::new(ScriptedDriver::new(), ScriptedOracle::new());
    let run = controller(&fixture, RunSettings::default());
    run.launch();
    wait_for_status(&run, RunStatus::Running).await;
    let mut rx = run.subscribe();

    assert!(run.handle_user_input("not json").await.is_err());
    assert!(run.handle_user_input(r#"{"type": "user_message", "message": ""}"#).await.is_err());

    let errors = drain_events(&mut rx)
        .into_iter()
        .filter(|event| matches!(event, RunEvent::Error { .. }))
        .count();
    assert_eq!(errors, 2);
    assert_eq!(fixture.oracle.classify_calls(), 0);
    assert_eq!(run.status(), RunStatus::Running);

    run.stop();
    within(run.wait()).await;
}

#[tokio::test]
async fn pause_suspends_observation_until_resumed() {
    let fixture = Fixture::new(ScriptedDriver::new(), ScriptedOracle::new());
    let run = controller(&fixture, RunSettings::default());
    run.launch();
    wait_for_analyses(&fixture, 1).await;

    assert!(run.pause());
    assert!(!run.pause(), "pausing twice is a no-op");
    assert_eq!(run.status(), RunStatus::Paused);

    // Let any in-flight transition settle, then make sure nothing moves.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let paused_at = fixture.oracle.analyze_calls();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fixture.oracle.analyze_calls(), paused_at);

    assert!(run.resume());
    wait_for_analyses(&fixture, paused_at + 1).await;

    run.stop();
    assert_eq!(within(run.wait()).await, RunStatus::Stopped);
    assert_eq!(fixture.driver.quit_count(), 1);
}

#[tokio::test]
async fn stop_while_paused_ends_the_run() {
    let fixture = Fixture::new(ScriptedDriver::new(), ScriptedOracle::new());
    let run = controller(&fixture, RunSettings::default());
    run.launch();
    wait_for_status(&run, RunStatus::Running).await;
    assert!(run.pause());

    run.stop();
    run.stop();

    assert_eq!(within(run.wait()).await, RunStatus::Stopped);
    assert_eq!(fixture.driver.quit_count(), 1);
}

#[tokio::test]
async fn stop_is_idempotent_and_keeps_terminal_status() {
    let fixture = Fixture::new(
        ScriptedDriver::new(),
        ScriptedOracle::new()
            .with_plan(&["Open the app"])
            .with_decisions([decision(ActionKind::Complete)]),
    );
    let run = controller(&fixture, RunSettings::default());

    assert_eq!(within(run.clone().start()).await, RunStatus::Completed);
    let mut rx = run.subscribe();
    run.stop();
    run.stop();

    assert_eq!(run.status(), RunStatus::Completed);
    assert!(run.should_stop());
    assert!(drain_events(&mut rx).is_empty());
    assert_eq!(fixture.driver.quit_count(), 1);
}

#[tokio::test]
async fn restart_with_new_goal_replans() {
    let fixture = Fixture::new(ScriptedDriver::new(), ScriptedOracle::new());
    let run = controller(&fixture, RunSettings::default());
    run.launch();
    wait_for_analyses(&fixture, 1).await;

    assert!(within(run.restart(Some("Open settings".into()))).await);
    assert_eq!(run.goal(), "Open settings");
    assert_eq!(fixture.driver.quit_count(), 1, "previous session released");

    within(async {
        while fixture.oracle.plan_calls() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    run.stop();
    assert_eq!(within(run.wait()).await, RunStatus::Stopped);
    assert_eq!(fixture.driver.quit_count(), 2, "one release per attempt");
    let starts = fixture
        .driver
        .count(|call| matches!(call, DriverCall::StartSession(_)));
    assert_eq!(starts, 2);
}

/// A run driven through `start()` is joined by a restart like a launched one.
#[tokio::test]
async fn restart_of_started_run_joins_previous_loop() {
    let fixture = Fixture::new(ScriptedDriver::new(), ScriptedOracle::new());
    let run = controller(&fixture, RunSettings::default());
    let started = tokio::spawn(run.clone().start());
    wait_for_analyses(&fixture, 1).await;

    assert!(within(run.restart(None)).await);
    assert_eq!(fixture.driver.quit_count(), 1, "previous session released");
    assert!(!started.is_finished(), "start follows the restarted attempt");

    wait_for_status(&run, RunStatus::Running).await;
    run.stop();
    let status = within(started).await.expect("start task");
    assert_eq!(status, RunStatus::Stopped);
    let starts = fixture
        .driver
        .count(|call| matches!(call, DriverCall::StartSession(_)));
    assert_eq!(starts, 2);
    assert_eq!(fixture.driver.quit_count(), 2);
}

#[tokio::test]
async fn stop_before_launch_still_reports_completion() {
    let fixture = Fixture::new(ScriptedDriver::new(), ScriptedOracle::new());
    let run = controller(&fixture, RunSettings::default());
    let mut rx = run.subscribe();

    run.stop();
    run.launch();
    assert_eq!(within(run.wait()).await, RunStatus::Stopped);

    let events = drain_events(&mut rx);
    assert_eq!(kinds(&events), vec!["status", "complete"]);
    assert_eq!(complete_status(&events), Some(RunStatus::Stopped));
    assert!(run.finished_at().is_some());
    assert!(fixture.driver.calls().is_empty(), "no session opened");

    run.launch();
    within(run.wait()).await;
    assert!(drain_events(&mut rx).is_empty(), "reported once");
}

#[tokio::test]
async fn restart_rejects_empty_goal() {
    let fixture = Fixture::new(ScriptedDriver::new(), ScriptedOracle::new());
    let run = controller(&fixture, RunSettings::default());
    run.launch();
    wait_for_status(&run, RunStatus::Running).await;

    assert!(!run.restart(Some("  ".into())).await);
    assert_eq!(run.status(), RunStatus::Running);

    run.stop();
    within(run.wait()).await;
    assert_eq!(fixture.driver.quit_count(), 1);
}

#[tokio::test]
async fn update_goal_intent_restarts_through_router() {
    let fixture = Fixture::new(
        ScriptedDriver::new(),
        ScriptedOracle::new().with_intents([Ok(ToolCall::UpdateGoal {
            new_goal: "Open settings".into(),
        })]),
    );
    let run = controller(&fixture, RunSettings::default());
    run.launch();
    wait_for_analyses(&fixture, 1).await;

    within(run.handle_message("actually, open settings instead")).await;

    assert_eq!(run.goal(), "Open settings");
    wait_for_status(&run, RunStatus::Running).await;
    run.stop();
    within(run.wait()).await;
    assert_eq!(fixture.driver.quit_count(), 2);
}

#[tokio::test]
async fn step_ceiling_times_out() {
    let fixture = Fixture::new(ScriptedDriver::new(), ScriptedOracle::new());
    let settings = RunSettings {
        max_steps: 3,
        ..RunSettings::default()
    };
    let run = controller(&fixture, settings);
    let mut rx = run.subscribe();

    assert_eq!(within(run.clone().start()).await, RunStatus::Timeout);
    let events = drain_events(&mut rx);

    assert_eq!(fixture.oracle.analyze_calls(), 3);
    assert!(events.contains(&RunEvent::error("Step limit of 3 observations reached")));
    assert_eq!(complete_status(&events), Some(RunStatus::Timeout));
    assert_eq!(fixture.driver.quit_count(), 1);
}

#[tokio::test]
async fn panic_in_loop_fails_and_cleans_up() {
    let fixture = Fixture::new(
        ScriptedDriver::new().panicking_on_screenshot(),
        ScriptedOracle::new(),
    );
    let run = controller(&fixture, RunSettings::default());
    let mut rx = run.subscribe();
    run.launch();

    assert_eq!(within(run.wait()).await, RunStatus::Failed);
    let events = drain_events(&mut rx);
    let internal = events.iter().any(|event| {
        matches!(event, RunEvent::Error { message } if message.starts_with("Internal error"))
    });
    assert!(internal, "{events:?}");
    assert_eq!(complete_status(&events), Some(RunStatus::Failed));
    assert_eq!(fixture.driver.quit_count(), 1);
}

#[tokio::test]
async fn verification_can_complete_steps_without_actions() {
    let fixture = Fixture::new(
        ScriptedDriver::new(),
        ScriptedOracle::new()
            .with_plan(&["Open the app", "See the home screen"])
            .with_verdicts([
                Ok(Verdict {
                    completed: true,
                    reason: "app open".into(),
                }),
                Ok(Verdict {
                    completed: true,
                    reason: "home visible".into(),
                }),
            ]),
    );
    let mut settings = RunSettings::default();
    settings.cycle.verify = pilot::io::config::VerifyPolicy::BeforeAnalyze;
    let run = controller(&fixture, settings);

    assert_eq!(within(run.clone().start()).await, RunStatus::Completed);
    assert_eq!(fixture.oracle.verify_calls(), 2);
    assert_eq!(fixture.oracle.analyze_calls(), 0);
    assert!(fixture.driver.actions().is_empty());
}

#[tokio::test]
async fn late_observer_sees_backlog() {
    let fixture = Fixture::new(
        ScriptedDriver::new(),
        ScriptedOracle::new()
            .with_plan(&["Open the app"])
            .with_decisions([decision(ActionKind::Complete)]),
    );
    let run = controller(&fixture, RunSettings::default());
    within(run.clone().start()).await;

    let (backlog, _rx) = run.events().subscribe_with_backlog();
    assert_eq!(kinds(&backlog).first(), Some(&"status"));
    assert_eq!(complete_status(&backlog), Some(RunStatus::Completed));
    assert!(!kinds(&backlog).contains(&"screenshot"));
}

#[tokio::test]
async fn finished_runs_are_archived() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = Fixture::new(
        ScriptedDriver::new(),
        ScriptedOracle::new()
            .with_plan(&["Open the app"])
            .with_decisions([decision(ActionKind::Done)]),
    );
    let settings = RunSettings {
        archive_dir: Some(dir.path().to_path_buf()),
        ..RunSettings::default()
    };
    let run = controller(&fixture, settings);

    assert_eq!(within(run.clone().start()).await, RunStatus::Completed);

    let run_dir = dir.path().join(run.run_id());
    let summary: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(run_dir.join("summary.json")).expect("summary"),
    )
    .expect("summary json");
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["current_step_index"], 1);
    assert!(run_dir.join("history.json").exists());
}
