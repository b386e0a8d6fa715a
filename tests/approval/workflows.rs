use serde_json::json;

use helmsman::EngineError;
use helmsman::approval::{ApprovalKind, ApprovalPayload, BrokerResponse, Resolution};

use crate::harness::{Fixture, ScriptedBroker, fields};

fn payload() -> ApprovalPayload {
    ApprovalPayload::new(fields(&[("path", json!("/srv/release.tar")), ("mode", json!("fast"))]))
        .editable(["mode"])
}

#[tokio::test]
async fn denial_at_confirmation_never_reaches_review() {
    let broker = ScriptedBroker::new(vec![
        BrokerResponse::approve(),
        BrokerResponse::deny("not during the freeze"),
    ]);
    let fx = Fixture::new(broker.clone());
    fx.session
        .define_approval_workflow("deploy", &["permission", "confirmation", "review"])
        .unwrap();

    let outcome = fx
        .session
        .run_approval_workflow("deploy", "ship the release", payload())
        .await
        .unwrap();

    assert_eq!(outcome.resolution, Resolution::Denied);
    assert!(!outcome.is_approved());
    assert_eq!(outcome.gates.len(), 2);
    let asked: Vec<ApprovalKind> = broker.seen().iter().map(|request| request.kind).collect();
    assert_eq!(asked, vec![ApprovalKind::Permission, ApprovalKind::Confirmation]);
}

#[tokio::test]
async fn edits_carry_forward_to_later_gates() {
    let broker = ScriptedBroker::new(vec![
        BrokerResponse::modify(fields(&[("mode", json!("careful"))])),
        BrokerResponse::approve(),
    ]);
    let fx = Fixture::new(broker.clone());
    fx.session
        .define_approval_workflow("edit-then-confirm", &["edit", "confirmation"])
        .unwrap();

    let outcome = fx
        .session
        .run_approval_workflow("edit-then-confirm", "tune the rollout", payload())
        .await
        .unwrap();

    assert_eq!(outcome.resolution, Resolution::Modified);
    assert_eq!(outcome.payload.fields["mode"], json!("careful"));
    assert_eq!(broker.seen()[1].payload.fields["mode"], json!("careful"));
}

#[tokio::test]
async fn unknown_workflow_and_bad_definitions_are_rejected() {
    let fx = Fixture::new(ScriptedBroker::approving());
    assert!(matches!(
        fx.session.run_approval_workflow("missing", "x", payload()).await,
        Err(EngineError::WorkflowNotFound(_))
    ));
    assert!(matches!(
        fx.session.define_approval_workflow("broken", &["permission", "telepathy"]),
        Err(EngineError::WorkflowDefinition(_))
    ));
    assert!(matches!(
        fx.session.define_approval_workflow("empty", &[]),
        Err(EngineError::WorkflowDefinition(_))
    ));
}
