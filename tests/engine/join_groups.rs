use std::time::Duration;

use helmsman::approval::BrokerResponse;
use helmsman::breakpoints::BreakpointSpec;
use helmsman::engine::JoinStatus;
use helmsman::observability::EngineEvent;
use helmsman::plan::StepStatus;
use helmsman::snapshot::SnapshotOrigin;
use helmsman::{EngineError, EngineStatus};

use crate::harness::{Fixture, ScriptedBroker, ping, plan, write};

#[tokio::test]
async fn group_members_all_commit_and_snapshot_in_order() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    let steps = vec![
        ping("a").join("probe"),
        ping("b").join("probe"),
        ping("c").join("probe"),
        ping("d"),
    ];
    let outcome = fx.session.start(plan(steps)).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Completed);
    let group = &outcome.report.join_groups[0];
    assert_eq!(group.status, JoinStatus::Succeeded);
    assert_eq!(group.committed, vec!["a", "b", "c"]);
    assert!(outcome.report.unreconciled.is_empty());

    let history: Vec<&str> = fx
        .session
        .state()
        .history
        .iter()
        .map(|entry| entry.step_id.as_str())
        .collect();
    assert_eq!(history, vec!["a", "b", "c", "d"]);

    let automatic: Vec<usize> = fx
        .session
        .get_state_history()
        .iter()
        .filter(|snapshot| snapshot.origin == SnapshotOrigin::Auto)
        .map(|snapshot| snapshot.step_index)
        .collect();
    assert_eq!(automatic, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn members_run_concurrently() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.invoker.delay("a", Duration::from_millis(300));
    fx.invoker.delay("b", Duration::from_millis(300));
    let steps = vec![ping("a").join("slow"), ping("b").join("slow")];

    let started = std::time::Instant::now();
    let outcome = fx.session.start(plan(steps)).await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Completed);
    assert!(started.elapsed() < Duration::from_millis(590));
}

#[tokio::test]
async fn denied_member_aborts_group_and_flags_committed_effects() {
    let broker = ScriptedBroker::new(vec![BrokerResponse::deny("no writes in this group")]);
    let mut fx = Fixture::new(broker);
    let steps = vec![
        ping("a").join("mixed"),
        ping("c").join("mixed"),
        write("b", "/tmp/b.txt").join("mixed"),
        ping("after"),
    ];
    let outcome = fx.session.start(plan(steps)).await.unwrap();

    let group = &outcome.report.join_groups[0];
    assert_eq!(group.status, JoinStatus::Aborted);
    assert_eq!(group.committed, vec!["a", "c"]);
    let flagged: Vec<&str> = outcome
        .report
        .unreconciled
        .iter()
        .map(|effect| effect.step_id.as_str())
        .collect();
    assert_eq!(flagged, vec!["a", "c"]);
    assert!(outcome.report.skipped.contains(&"b".to_string()));

    // The group is optional, so the plan carries on.
    assert_eq!(outcome.status, EngineStatus::Completed);
    assert!(fx.invoker.calls().contains(&"after".to_string()));
    assert!(fx
        .events()
        .iter()
        .any(|event| matches!(event, EngineEvent::JoinGroupSettled { status: JoinStatus::Aborted, .. })));
}

#[tokio::test]
async fn denial_in_a_mandatory_group_fails_the_plan() {
    let broker = ScriptedBroker::new(vec![BrokerResponse::deny("no")]);
    let mut fx = Fixture::new(broker);
    let steps = vec![
        write("w", "/tmp/w.txt").join("g").mandatory(),
        ping("p").join("g"),
        ping("after"),
    ];
    let outcome = fx.session.start(plan(steps)).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Failed);
    assert!(matches!(outcome.error, Some(EngineError::ApprovalDenied { .. })));
    assert_eq!(fx.session.state().status_of(1), Some(StepStatus::Skipped));
    assert!(fx.invoker.calls().is_empty());
}

#[tokio::test]
async fn failing_member_fails_the_plan_without_retry() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.invoker.fail_times("b", 5);
    let steps = vec![
        ping("a").join("g"),
        ping("b").join("g"),
        ping("c").join("g"),
        ping("after"),
    ];
    let outcome = fx.session.start(plan(steps)).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Failed);
    assert!(matches!(
        &outcome.error,
        Some(EngineError::ToolExecution { step_id, attempts: 1, .. }) if step_id == "b"
    ));
    let group = &outcome.report.join_groups[0];
    assert_eq!(group.status, JoinStatus::Aborted);
    assert_eq!(group.committed, vec!["a", "c"]);
    assert_eq!(outcome.report.unreconciled.len(), 2);
    assert_eq!(
        fx.invoker.calls().iter().filter(|call| *call == "b").count(),
        1
    );
    assert!(!fx.invoker.calls().contains(&"after".to_string()));
}

#[tokio::test]
async fn abort_cancels_in_flight_members() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.invoker.hang("stuck");
    let handle = fx.session.handle();
    let controller = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    };
    let steps = vec![ping("quick").join("g"), ping("stuck").join("g")];

    let run = async {
        let (outcome, ()) = tokio::join!(fx.session.start(plan(steps)), controller);
        outcome
    };
    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, EngineStatus::Aborted);
    let state = fx.session.state();
    assert_eq!(state.status_of(0), Some(StepStatus::Succeeded));
    assert_eq!(state.status_of(1), Some(StepStatus::Failed));
    let group = &outcome.report.join_groups[0];
    assert_eq!(group.status, JoinStatus::Aborted);
    assert_eq!(outcome.report.unreconciled[0].step_id, "quick");
}

fn fired_at(fx: &Fixture) -> Vec<usize> {
    fx.events()
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::BreakpointFired { step_index, .. } => Some(step_index),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn periodic_breakpoint_checks_each_member_at_its_own_index() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session.add_breakpoint(BreakpointSpec::periodic(3)).unwrap();
    let steps = (0..10)
        .map(|index| {
            let step = ping(&format!("s{index}"));
            if (5..=7).contains(&index) {
                step.join("middle")
            } else {
                step
            }
        })
        .collect();

    let mut paused_at = Vec::new();
    let mut outcome = fx.session.start(plan(steps)).await.unwrap();
    while outcome.status == EngineStatus::Paused {
        paused_at.push(outcome.paused_at.unwrap());
        outcome = fx.session.resume().await.unwrap();
    }

    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(paused_at, vec![3, 6, 9]);
    assert_eq!(fx.session.list_breakpoints()[0].hit_count, 3);
    assert_eq!(fired_at(&fx), vec![3, 6, 9]);
    assert_eq!(fx.invoker.calls().len(), 10);
}

#[tokio::test]
async fn group_start_index_fires_only_for_the_first_member() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session.add_breakpoint(BreakpointSpec::periodic(2)).unwrap();
    let steps = vec![
        ping("a"),
        ping("b"),
        ping("c").join("g"),
        ping("d").join("g"),
    ];
    let outcome = fx.session.start(plan(steps)).await.unwrap();

    assert_eq!(outcome.paused_at, Some(2));
    assert_eq!(fx.session.list_breakpoints()[0].hit_count, 1);
    assert_eq!(fired_at(&fx), vec![2]);
}

#[tokio::test]
async fn condition_reads_the_member_step_index() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session
        .add_breakpoint(BreakpointSpec::conditional("step_index == 2"))
        .unwrap();
    let steps = vec![
        ping("a"),
        ping("b").join("g"),
        ping("c").join("g"),
        ping("d"),
    ];
    let outcome = fx.session.start(plan(steps)).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Paused);
    assert_eq!(outcome.paused_at, Some(2));
    assert_eq!(fx.invoker.calls(), vec!["a"]);
    assert_eq!(fx.session.resume().await.unwrap().status, EngineStatus::Completed);
    assert_eq!(fx.invoker.calls(), vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn after_step_hits_report_each_member_position() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session.add_breakpoint(BreakpointSpec::after_tool()).unwrap();
    let steps = vec![ping("a").join("g"), ping("b").join("g"), ping("c")];
    let outcome = fx.session.start(plan(steps)).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Paused);
    assert_eq!(outcome.paused_at, Some(2));
    assert_eq!(fired_at(&fx), vec![0, 1]);
}

#[tokio::test]
async fn panicking_member_fails_the_plan() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.invoker.panic_on("boom");
    let steps = vec![ping("ok").join("g"), ping("boom").join("g"), ping("after")];
    let outcome = fx.session.start(plan(steps)).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Failed);
    assert!(matches!(
        &outcome.error,
        Some(EngineError::ToolExecution { step_id, attempts: 1, message, .. })
            if step_id == "boom" && message.contains("panicked")
    ));
    let group = &outcome.report.join_groups[0];
    assert_eq!(group.status, JoinStatus::Aborted);
    assert_eq!(group.committed, vec!["ok"]);
    assert_eq!(outcome.report.unreconciled[0].step_id, "ok");

    let state = fx.session.state();
    assert_eq!(state.status_of(1), Some(StepStatus::Failed));
    let boom = state
        .history
        .iter()
        .find(|entry| entry.step_id == "boom")
        .unwrap();
    assert_ne!(boom.message, "failed: cancelled");
    assert!(!fx.invoker.calls().contains(&"after".to_string()));
    assert!(!fx
        .events()
        .iter()
        .any(|event| matches!(event, EngineEvent::Cancelled { .. })));
}
