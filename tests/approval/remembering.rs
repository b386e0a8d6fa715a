use std::sync::Arc;

use tempfile::TempDir;

use helmsman::EngineStatus;
use helmsman::approval::{BrokerResponse, PolicyStore, RememberScope};

use crate::harness::{Fixture, ScriptedBroker, plan, test_config, write};

fn write_plan() -> helmsman::plan::Plan {
    plan(vec![write("w", "/tmp/report.txt")])
}

#[tokio::test]
async fn session_decision_answers_repeats_until_the_session_ends() {
    let policy = Arc::new(PolicyStore::in_memory());
    let broker = ScriptedBroker::new(vec![
        BrokerResponse::approve().remember(RememberScope::Session),
    ]);
    let mut fx = Fixture::with(test_config(), broker.clone(), Arc::clone(&policy));

    fx.session.start(write_plan()).await.unwrap();
    let outcome = fx.session.start(write_plan()).await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(broker.seen().len(), 1);
    assert_eq!(fx.session.get_middleware_stats().auto_resolved, 1);

    assert_eq!(fx.session.end_session(), 1);

    let next_broker = ScriptedBroker::approving();
    let mut next = Fixture::with(test_config(), next_broker.clone(), policy);
    next.session.start(write_plan()).await.unwrap();
    assert_eq!(next_broker.seen().len(), 1);
}

#[tokio::test]
async fn persistent_decision_survives_a_reload() {
    let tmp = TempDir::new().unwrap();
    let store_path = tmp.path().join("policies.toml");

    let broker = ScriptedBroker::new(vec![
        BrokerResponse::approve().remember(RememberScope::Persistent),
    ]);
    let mut first = Fixture::with(
        test_config(),
        broker.clone(),
        Arc::new(PolicyStore::load(&store_path)),
    );
    first.session.start(write_plan()).await.unwrap();
    first.session.end_session();
    assert!(store_path.exists());

    let reloaded = Arc::new(PolicyStore::load(&store_path));
    let later_broker = ScriptedBroker::approving();
    let mut second = Fixture::with(test_config(), later_broker.clone(), Arc::clone(&reloaded));
    let outcome = second.session.start(write_plan()).await.unwrap();
    assert_eq!(outcome.status, EngineStatus::Completed);
    assert!(later_broker.seen().is_empty());

    reloaded.clear_persistent().unwrap();
    second.session.start(write_plan()).await.unwrap();
    assert_eq!(later_broker.seen().len(), 1);
}

#[tokio::test]
async fn remembered_denial_skips_without_asking() {
    let broker = ScriptedBroker::new(vec![
        BrokerResponse::deny("never here").remember(RememberScope::Session),
    ]);
    let mut fx = Fixture::new(broker.clone());

    fx.session.start(write_plan()).await.unwrap();
    let outcome = fx.session.start(write_plan()).await.unwrap();
    assert_eq!(outcome.report.skipped, vec!["w"]);
    assert_eq!(broker.seen().len(), 1);
    assert!(fx.invoker.calls().is_empty());
}
