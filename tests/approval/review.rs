use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use helmsman::approval::{ApprovalKind, BrokerResponse, PolicyStore, Resolution};
use helmsman::{EngineError, EngineStatus};

use crate::harness::{Fixture, ScriptedBroker, fields, plan, test_config, write};

#[tokio::test]
async fn review_applies_only_editable_fields() {
    let broker = ScriptedBroker::new(vec![BrokerResponse::modify(fields(&[
        ("path", json!("/tmp/reviewed.txt")),
        ("action", json!("delete")),
    ]))]);
    let fx = Fixture::new(broker.clone());
    let params = fields(&[
        ("action", json!("write")),
        ("path", json!("/tmp/draft.txt")),
        ("content", json!("hello")),
    ]);

    let outcome = fx
        .session
        .review_before_action("file_operations", params, &["path"])
        .await
        .unwrap();

    assert_eq!(outcome.resolution, Resolution::Modified);
    assert_eq!(outcome.payload.fields["path"], json!("/tmp/reviewed.txt"));
    assert_eq!(outcome.payload.fields["action"], json!("write"));
    let seen = broker.seen();
    assert_eq!(seen[0].kind, ApprovalKind::Review);
    assert!(seen[0].signature.is_none());
    assert_eq!(fx.session.get_middleware_stats().modified, 1);
}

#[tokio::test]
async fn escalating_edit_is_asked_again_before_running() {
    let broker = ScriptedBroker::new(vec![
        BrokerResponse::modify(fields(&[("action", json!("delete"))])),
        BrokerResponse::approve(),
    ]);
    let mut fx = Fixture::new(broker.clone());
    let outcome = fx
        .session
        .start(plan(vec![write("w", "/tmp/old.log")]))
        .await
        .unwrap();

    assert_eq!(outcome.status, EngineStatus::Completed);
    let seen = broker.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen[1].sensitivity > seen[0].sensitivity);
    assert_eq!(fx.session.get_middleware_stats().escalations, 1);
    let edited = fx.session.state().overrides.get(&0).unwrap();
    assert_eq!(edited.action_name(), "delete");
}

#[tokio::test]
async fn unanswered_mandatory_approval_times_out_and_fails() {
    let mut config = test_config();
    config.approval.timeout_secs = 1;
    let mut fx = Fixture::with(
        config,
        ScriptedBroker::slow(Duration::from_secs(3)),
        Arc::new(PolicyStore::in_memory()),
    );
    let outcome = fx
        .session
        .start(plan(vec![write("w", "/tmp/w.txt").mandatory()]))
        .await
        .unwrap();

    assert_eq!(outcome.status, EngineStatus::Failed);
    assert!(matches!(
        outcome.error,
        Some(EngineError::ApprovalTimeout { waited_secs: 1, .. })
    ));
    assert_eq!(fx.session.get_middleware_stats().timed_out, 1);
    assert!(fx.invoker.calls().is_empty());
}

#[tokio::test]
async fn approved_escalation_is_not_asked_again_on_retry() {
    let broker = ScriptedBroker::new(vec![
        BrokerResponse::modify(fields(&[("action", json!("delete"))])),
        BrokerResponse::approve(),
    ]);
    let mut fx = Fixture::new(broker.clone());
    fx.invoker.fail_times("/tmp/old.log", 1);
    let outcome = fx
        .session
        .start(plan(vec![write("w", "/tmp/old.log")]))
        .await
        .unwrap();

    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(broker.seen().len(), 2);
    assert_eq!(fx.invoker.calls(), vec!["/tmp/old.log", "/tmp/old.log"]);
    assert_eq!(outcome.report.retries_for("w").len(), 1);
}
