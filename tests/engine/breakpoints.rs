use helmsman::approval::ApprovalKind;
use helmsman::breakpoints::BreakpointSpec;
use helmsman::observability::EngineEvent;
use helmsman::{EngineError, EngineStatus};

use crate::harness::{Fixture, ScriptedBroker, ping, pings, plan};

fn ten_steps() -> helmsman::plan::Plan {
    pings(&["s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9"])
}

#[tokio::test]
async fn periodic_breakpoint_pauses_every_third_step() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session.add_breakpoint(BreakpointSpec::periodic(3)).unwrap();

    let mut paused_at = Vec::new();
    let mut outcome = fx.session.start(ten_steps()).await.unwrap();
    while outcome.status == EngineStatus::Paused {
        paused_at.push(outcome.paused_at.unwrap());
        outcome = fx.session.resume().await.unwrap();
    }

    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(paused_at, vec![3, 6, 9]);
    assert_eq!(fx.invoker.calls().len(), 10);
    assert_eq!(fx.session.list_breakpoints()[0].hit_count, 3);

    let fired: Vec<usize> = fx
        .events()
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::BreakpointFired { step_index, .. } => Some(step_index),
            _ => None,
        })
        .collect();
    assert_eq!(fired, vec![3, 6, 9]);
}

#[tokio::test]
async fn resume_does_not_refire_the_same_breakpoint() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session
        .add_breakpoint(BreakpointSpec::before_tool().tool("network_diagnostics"))
        .unwrap();

    let outcome = fx.session.start(pings(&["a", "b"])).await.unwrap();
    assert_eq!(outcome.paused_at, Some(0));
    let outcome = fx.session.resume().await.unwrap();
    assert_eq!(outcome.paused_at, Some(1));
    assert_eq!(fx.invoker.calls(), vec!["a"]);
    let outcome = fx.session.resume().await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Completed);
}

#[tokio::test]
async fn tool_filter_limits_where_a_breakpoint_fires() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session
        .add_breakpoint(BreakpointSpec::before_tool().tool("shell"))
        .unwrap();
    let outcome = fx.session.start(pings(&["a", "b"])).await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Completed);
}

#[tokio::test]
async fn after_tool_breakpoint_pauses_past_the_step() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session
        .add_breakpoint(BreakpointSpec::after_tool().once())
        .unwrap();
    let outcome = fx.session.start(pings(&["a", "b"])).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Paused);
    assert_eq!(outcome.paused_at, Some(1));
    assert_eq!(fx.invoker.calls(), vec!["a"]);
}

#[tokio::test]
async fn condition_breakpoint_reads_execution_state() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.session
        .add_breakpoint(BreakpointSpec::conditional("tool_usage.network_diagnostics >= 2").once())
        .unwrap();
    let outcome = fx.session.start(pings(&["a", "b", "c", "d"])).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Paused);
    assert_eq!(outcome.paused_at, Some(2));
    assert!(outcome.condition_errors.is_empty());
}

#[tokio::test]
async fn broken_condition_pauses_and_reports_the_error() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    let id = fx
        .session
        .add_breakpoint(BreakpointSpec::conditional("bogus_field == 1").once())
        .unwrap();
    let outcome = fx.session.start(pings(&["a", "b"])).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Paused);
    assert_eq!(outcome.paused_at, Some(0));
    assert_eq!(outcome.condition_errors.len(), 1);
    assert!(matches!(
        &outcome.condition_errors[0],
        EngineError::BreakpointCondition { id: hit, .. } if *hit == id
    ));
    assert!(fx
        .events()
        .iter()
        .any(|event| matches!(event, EngineEvent::BreakpointConditionError { .. })));
}

#[tokio::test]
async fn approval_breakpoint_asks_instead_of_pausing() {
    let broker = ScriptedBroker::approving();
    let mut fx = Fixture::new(broker.clone());
    fx.session
        .add_breakpoint(
            BreakpointSpec::before_tool()
                .tool("network_diagnostics")
                .require_approval()
                .once(),
        )
        .unwrap();
    let outcome = fx.session.start(pings(&["a", "b"])).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Completed);
    let seen = broker.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind, ApprovalKind::Breakpoint);
    assert!(seen[0].signature.is_none());
}

#[tokio::test]
async fn on_error_breakpoint_pauses_between_retries() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.invoker.fail_times("a", 1);
    fx.session
        .add_breakpoint(BreakpointSpec::on_error().once())
        .unwrap();

    let outcome = fx.session.start(plan(vec![ping("a"), ping("b")])).await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Paused);
    assert_eq!(outcome.paused_at, Some(0));
    assert_eq!(fx.invoker.calls(), vec!["a"]);

    let outcome = fx.session.resume().await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(fx.invoker.calls(), vec!["a", "a", "b"]);
    assert_eq!(outcome.report.retries_for("a").len(), 1);
}

#[tokio::test]
async fn manual_breakpoint_fires_only_when_armed() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    let id = fx
        .session
        .add_breakpoint(BreakpointSpec::manual().id("stop-here"))
        .unwrap();
    assert_eq!(id, "stop-here");
    fx.session.engine_mut().arm_breakpoint(&id).unwrap();

    let outcome = fx.session.start(pings(&["a", "b"])).await.unwrap();
    assert_eq!(outcome.paused_at, Some(0));
    let outcome = fx.session.resume().await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Completed);
}

#[tokio::test]
async fn removed_breakpoint_no_longer_fires() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    let id = fx.session.add_breakpoint(BreakpointSpec::before_tool()).unwrap();
    fx.session.remove_breakpoint(&id).unwrap();
    assert!(fx.session.list_breakpoints().is_empty());
    assert!(matches!(
        fx.session.remove_breakpoint(&id),
        Err(EngineError::BreakpointNotFound(_))
    ));

    let outcome = fx.session.start(pings(&["a"])).await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Completed);
}
