use std::time::Duration;

use serde_json::json;

use helmsman::approval::{BrokerResponse, QueuedApprovalBroker};
use helmsman::observability::EngineEvent;
use helmsman::plan::{Plan, PlanId, StepStatus};
use helmsman::snapshot::SnapshotOrigin;
use helmsman::{EngineError, EngineStatus};

use crate::harness::{Fixture, ScriptedBroker, fields, ping, pings, plan, write};

#[tokio::test]
async fn completes_plan_and_snapshots_every_step() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    let outcome = fx.session.start(pings(&["a", "b", "c", "d"])).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Completed);
    assert!(outcome.is_completed());
    assert_eq!(outcome.report.succeeded, vec!["a", "b", "c", "d"]);
    assert_eq!(fx.invoker.calls(), vec!["a", "b", "c", "d"]);

    let history = fx.session.get_state_history();
    assert_eq!(history[0].origin, SnapshotOrigin::Initial);
    let automatic: Vec<usize> = history
        .iter()
        .filter(|snapshot| snapshot.origin == SnapshotOrigin::Auto)
        .map(|snapshot| snapshot.step_index)
        .collect();
    assert_eq!(automatic, vec![1, 2, 3, 4]);
    assert!(history.windows(2).all(|pair| pair[0].seq < pair[1].seq));
}

#[tokio::test]
async fn output_var_stores_tool_data() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    let steps = vec![ping("a").output_var("probe"), ping("b")];
    fx.session.start(plan(steps)).await.unwrap();

    let state = fx.session.state();
    assert_eq!(
        state.variables.get("probe"),
        Some(&json!({ "tool": "network_diagnostics", "target": "a" }))
    );
    assert_eq!(state.tool_usage.get("network_diagnostics"), Some(&2));
    assert_eq!(state.history.len(), 2);
}

#[tokio::test]
async fn empty_plan_is_rejected_without_leaving_idle() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    let empty = Plan {
        id: PlanId::default(),
        instruction: "nothing".into(),
        steps: Vec::new(),
        parent: None,
    };
    let result = fx.session.start(empty).await;
    assert!(matches!(result, Err(EngineError::PlanInvalid(_))));
    assert_eq!(fx.session.status(), EngineStatus::Idle);
    assert!(fx.session.get_state_history().is_empty());
}

#[tokio::test]
async fn denied_optional_step_is_skipped() {
    let broker = ScriptedBroker::new(vec![BrokerResponse::deny("not today")]);
    let mut fx = Fixture::new(broker.clone());
    let steps = vec![ping("a"), write("b", "/tmp/b.txt"), ping("c")];
    let outcome = fx.session.start(plan(steps)).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(outcome.report.succeeded, vec!["a", "c"]);
    assert_eq!(outcome.report.skipped, vec!["b"]);
    assert_eq!(fx.invoker.calls(), vec!["a", "c"]);
    assert_eq!(broker.seen().len(), 1);
    assert_eq!(broker.seen()[0].step_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn denied_mandatory_step_fails_the_plan() {
    let broker = ScriptedBroker::new(vec![BrokerResponse::deny("no writes")]);
    let mut fx = Fixture::new(broker);
    let steps = vec![ping("a"), write("b", "/tmp/b.txt").mandatory(), ping("c")];
    let outcome = fx.session.start(plan(steps)).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Failed);
    assert!(matches!(outcome.error, Some(EngineError::ApprovalDenied { .. })));
    assert_eq!(fx.session.state().status_of(1), Some(StepStatus::Skipped));
    assert_eq!(fx.session.state().status_of(2), Some(StepStatus::Pending));
    assert_eq!(fx.invoker.calls(), vec!["a"]);
}

#[tokio::test]
async fn approver_edits_replace_step_parameters() {
    let broker = ScriptedBroker::new(vec![BrokerResponse::modify(fields(&[(
        "path",
        json!("/tmp/safe.txt"),
    )]))]);
    let mut fx = Fixture::new(broker);
    let outcome = fx
        .session
        .start(plan(vec![write("w", "/tmp/danger.txt")]))
        .await
        .unwrap();

    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(fx.invoker.calls(), vec!["/tmp/safe.txt"]);
    let edited = fx.session.state().overrides.get(&0).unwrap();
    assert_eq!(edited.target().as_deref(), Some("/tmp/safe.txt"));
}

#[tokio::test]
async fn pause_while_waiting_discards_the_request_and_resume_asks_again() {
    let broker = QueuedApprovalBroker::new();
    let mut fx = Fixture::new(std::sync::Arc::new(broker.clone()));
    let handle = fx.session.handle();
    let steps = vec![ping("a"), write("b", "/tmp/b.txt"), ping("c")];

    let first = {
        let controller = async {
            let request = broker.next_pending().await;
            handle.pause();
            request
        };
        let (outcome, request) = tokio::join!(fx.session.start(plan(steps)), controller);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, EngineStatus::WaitingApproval);
        assert_eq!(outcome.waiting_on.as_deref(), Some("b"));
        request
    };
    assert!(broker.pending().is_empty());
    assert!(fx.events().iter().any(|event| matches!(
        event,
        EngineEvent::ApprovalDiscarded { request_id } if *request_id == first.id
    )));

    let answer = async {
        let request = broker.next_pending().await;
        broker.resolve(&request.id, BrokerResponse::approve()).unwrap();
        request
    };
    let (outcome, second) = tokio::join!(fx.session.resume(), answer);
    assert_eq!(outcome.unwrap().status, EngineStatus::Completed);
    assert_ne!(first.id, second.id);
    assert_eq!(second.step_id.as_deref(), Some("b"));
    assert_eq!(fx.invoker.calls(), vec!["a", "/tmp/b.txt", "c"]);
}

#[tokio::test]
async fn abort_cancels_a_cooperative_tool_call() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.invoker.delay("slow", Duration::from_secs(30));
    let handle = fx.session.handle();
    let controller = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    };

    let run = async {
        let (outcome, ()) = tokio::join!(fx.session.start(pings(&["a", "slow", "c"])), controller);
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
    assert_eq!(state.status_of(2), Some(StepStatus::Pending));
    assert_eq!(state.history.last().unwrap().message, "failed: cancelled");
    assert!(!fx.invoker.calls().contains(&"c".to_string()));
}

#[tokio::test]
async fn abort_gives_up_on_a_stuck_call_after_the_grace_period() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.invoker.hang("stuck");
    let handle = fx.session.handle();
    let controller = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    };

    let run = async {
        let (outcome, ()) = tokio::join!(fx.session.start(pings(&["stuck"])), controller);
        outcome
    };
    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, EngineStatus::Aborted);
    assert!(fx
        .events()
        .iter()
        .any(|event| matches!(event, EngineEvent::Cancelled { step_id } if step_id == "stuck")));
}

#[tokio::test]
async fn finished_engine_refuses_resume_and_accepts_a_new_plan() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session.start(pings(&["a"])).await.unwrap();
    assert!(matches!(
        fx.session.resume().await,
        Err(EngineError::InvalidTransition { .. })
    ));

    let outcome = fx.session.start(pings(&["b", "c"])).await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(outcome.report.plan_version, PlanId(1));
    assert_eq!(fx.session.engine().plans().len(), 2);
}

#[tokio::test]
async fn redirect_keeps_the_executed_prefix() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.planner.push_plan(vec![ping("x"), ping("y")]);
    fx.session
        .add_breakpoint(helmsman::breakpoints::BreakpointSpec::periodic(2).once())
        .unwrap();

    let paused = fx.session.start(pings(&["a", "b", "c"])).await.unwrap();
    assert_eq!(paused.status, EngineStatus::Paused);
    assert_eq!(paused.paused_at, Some(2));
    let snapshots_before = fx.session.get_state_history().len();

    let child = fx.session.redirect("take another route").await.unwrap();
    assert_eq!(child, PlanId(1));
    assert_eq!(fx.session.engine().plans().lineage(child), vec![PlanId(1), PlanId(0)]);
    assert_eq!(fx.session.get_state_history().len(), snapshots_before);
    assert_eq!(fx.session.status(), EngineStatus::Paused);

    let outcome = fx.session.resume().await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(outcome.report.succeeded, vec!["a", "b", "x", "y"]);
    assert_eq!(fx.invoker.calls(), vec!["a", "b", "x", "y"]);
}

#[tokio::test]
async fn redirect_requires_a_paused_engine() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session.start(pings(&["a"])).await.unwrap();
    assert!(matches!(
        fx.session.redirect("again").await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn pause_request_before_run_stops_at_the_first_step() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session
        .add_breakpoint(helmsman::breakpoints::BreakpointSpec::before_tool().once())
        .unwrap();
    let outcome = fx.session.start(pings(&["a", "b"])).await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Paused);
    assert_eq!(outcome.paused_at, Some(0));
    assert!(fx.invoker.calls().is_empty());

    let outcome = fx.session.resume().await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Completed);
}
