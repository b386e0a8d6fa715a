use helmsman::approval::BrokerResponse;
use helmsman::observability::EngineEvent;
use helmsman::plan::StepStatus;
use helmsman::{EngineError, EngineStatus};

use crate::harness::{Fixture, ScriptedBroker, ping, pings, plan, write};

#[tokio::test]
async fn exhausted_retries_fail_with_the_whole_attempt_history() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.invoker.fail_times("a", 10);
    let outcome = fx.session.start(pings(&["a", "b"])).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Failed);
    let Some(EngineError::ToolExecution {
        step_id,
        attempts,
        message,
        ..
    }) = &outcome.error
    else {
        panic!("expected a tool execution error, got {:?}", outcome.error);
    };
    assert_eq!(step_id, "a");
    assert_eq!(*attempts, 3);
    assert!(message.contains("attempt 1: a unreachable"));
    assert!(message.contains("attempt 3: a unreachable"));

    let retries = outcome.report.retries_for("a");
    assert_eq!(retries.len(), 3);
    assert_eq!(
        retries.iter().map(|record| record.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(fx.session.state().status_of(0), Some(StepStatus::Failed));
    assert_eq!(fx.planner.revise_calls(), vec!["a", "a"]);
    assert!(!fx.invoker.calls().contains(&"b".to_string()));
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.invoker.fail_times("a", 1);
    let outcome = fx.session.start(pings(&["a", "b"])).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(fx.invoker.calls(), vec!["a", "a", "b"]);
    assert_eq!(outcome.report.retries_for("a").len(), 1);
    assert!(fx.events().iter().any(|event| matches!(
        event,
        EngineEvent::RetryScheduled { step_id, attempt: 2, revised: false } if step_id == "a"
    )));
}

#[tokio::test]
async fn planner_revision_replaces_the_failed_parameters() {
    let mut fx = Fixture::new(ScriptedBroker::approving());
    fx.invoker.fail_times("primary", 10);
    let mut revision = ping("step");
    revision.params = ping("backup").params;
    fx.planner.push_revision(revision);

    let first = ping("step");
    let mut steps = vec![first];
    steps[0].params = ping("primary").params;
    let outcome = fx.session.start(plan(steps)).await.unwrap();

    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(fx.invoker.calls(), vec!["primary", "backup"]);
    let replaced = fx.session.state().overrides.get(&0).unwrap();
    assert_eq!(replaced.target().as_deref(), Some("backup"));
    assert!(fx.events().iter().any(|event| matches!(
        event,
        EngineEvent::RetryScheduled { revised: true, .. }
    )));
}

#[tokio::test]
async fn escalated_revision_goes_back_through_approval() {
    let broker = ScriptedBroker::new(vec![BrokerResponse::deny("revision too risky")]);
    let mut fx = Fixture::new(broker.clone());
    fx.invoker.fail_times("a", 10);
    let mut revision = write("a", "/etc/hosts");
    revision.id = "a".into();
    fx.planner.push_revision(revision);

    let outcome = fx.session.start(pings(&["a", "b"])).await.unwrap();

    let seen = broker.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].tool.as_deref(), Some("file_operations"));
    assert_eq!(fx.session.state().status_of(0), Some(StepStatus::Skipped));
    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(fx.invoker.calls(), vec!["a", "b"]);
}
