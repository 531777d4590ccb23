use arbor::config::EngineConfig;
use arbor::dsl::Tree;
use arbor::dsl::builder::{define, participant};
use arbor::participants::builtin::TraceParticipant;
use arbor::runtime::engine::{Engine, RecoveryReport};
use arbor::runtime::expression::{ChildRef, ExpressionState, FlowExpression};
use arbor::runtime::fei::FlowExpressionId;
use arbor::runtime::history::LogAction;
use arbor::runtime::storage::{ExpressionStore, InMemoryExpressionStore, InMemoryMessageQueue};
use arbor::runtime::workitem::Workitem;
use serde_json::{Map, json};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn engine_over(store: Arc<InMemoryExpressionStore>) -> (Arc<Engine>, Arc<TraceParticipant>) {
    let queue = Arc::new(InMemoryMessageQueue::new(64));
    let engine = Arc::new(Engine::new_with_storage(EngineConfig::default(), store, queue));
    let trace = Arc::new(TraceParticipant::new());
    engine.register_participant("alpha|bravo", trace.clone()).unwrap();
    (engine, trace)
}

fn waiting(mut exp: FlowExpression, children: Vec<ChildRef>) -> FlowExpression {
    exp.created = children.len();
    exp.children = children;
    exp.state = ExpressionState::Waiting;
    exp
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unapplied_root_is_applied_again() {
    let store = Arc::new(InMemoryExpressionStore::new());
    let root = FlowExpressionId::new_root("engine", "wf-applying");
    store
        .put(&FlowExpression::new(root.clone(), None, define([participant("alpha")]), Workitem::default()))
        .await
        .unwrap();

    let (engine, trace) = engine_over(store);
    let mut waiter = engine.subscribe();

    let report = engine.recover().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            reapplied: 1,
            regenerated: 0,
            cancelled: 0,
            unrecoverable: 0
        }
    );

    let _workers = engine.start_workers();
    let event = waiter.wait_for("wf-applying", WAIT).await.unwrap();
    assert_eq!(event.action, LogAction::Terminated);
    assert_eq!(trace.trace(), vec!["alpha"]);

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_child_is_regenerated() {
    let store = Arc::new(InMemoryExpressionStore::new());
    let root = FlowExpressionId::new_root("engine", "wf-gap");
    let mut fields = Map::new();
    fields.insert("x".to_string(), json!(1));
    let exp = FlowExpression::new(
        root.clone(),
        None,
        define([participant("alpha"), participant("bravo")]),
        Workitem::new(fields),
    );
    let child = ChildRef {
        fei: root.child(0),
        position: 0,
    };
    store.put(&waiting(exp, vec![child])).await.unwrap();

    let (engine, trace) = engine_over(store.clone());
    let mut waiter = engine.subscribe();

    let report = engine.recover().await.unwrap();
    assert_eq!(report.regenerated, 1);

    let rebuilt = store.get(&root.child(0)).await.unwrap().expect("child rebuilt");
    assert_eq!(rebuilt.name(), "alpha");
    assert_eq!(rebuilt.parent, Some(root.clone()));
    assert_eq!(rebuilt.applied_workitem.field("x"), Some(&json!(1)));

    let _workers = engine.start_workers();
    let event = waiter.wait_for("wf-gap", WAIT).await.unwrap();
    assert_eq!(event.action, LogAction::Terminated);
    assert_eq!(trace.trace(), vec!["alpha", "bravo"]);

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_subprocess_root_is_regenerated() {
    let store = Arc::new(InMemoryExpressionStore::new());
    let root = FlowExpressionId::new_root("engine", "wf-sub");
    let call = root.child(0);
    let sub_root = call.sub_process_root(0);

    let top = FlowExpression::new(
        root.clone(),
        None,
        define([Tree::new("subprocess").attr("ref", "review")]),
        Workitem::default(),
    );
    let subprocess = FlowExpression::new(
        call.clone(),
        Some(root.clone()),
        Tree::new("subprocess").attr("ref", "review"),
        Workitem::default(),
    );
    store
        .put(&waiting(top, vec![ChildRef { fei: call.clone(), position: 0 }]))
        .await
        .unwrap();
    store
        .put(&waiting(subprocess, vec![ChildRef { fei: sub_root.clone(), position: 0 }]))
        .await
        .unwrap();

    let (engine, trace) = engine_over(store.clone());
    engine.register_definition("review", define([participant("bravo")]));
    let mut waiter = engine.subscribe();

    let report = engine.recover().await.unwrap();
    assert_eq!(report.regenerated, 1);
    assert_eq!(store.get(&sub_root).await.unwrap().unwrap().name(), "define");

    let _workers = engine.start_workers();
    let event = waiter.wait_for("wf-sub", WAIT).await.unwrap();
    assert_eq!(event.action, LogAction::Terminated);
    assert_eq!(trace.trace(), vec!["bravo"]);

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_orphan_is_cancelled_with_its_subtree() {
    let store = Arc::new(InMemoryExpressionStore::new());
    let root = FlowExpressionId::new_root("engine", "wf-orphan");
    let orphan_fei = root.child(0);
    let grandchild = orphan_fei.child(0);

    // A concurrence that completed and went away before cancelling this
    // branch
    let orphan = FlowExpression::new(
        orphan_fei.clone(),
        Some(root.clone()),
        define([participant("alpha")]),
        Workitem::default(),
    );
    store
        .put(&waiting(orphan, vec![ChildRef { fei: grandchild.clone(), position: 0 }]))
        .await
        .unwrap();
    let leaf = FlowExpression::new(grandchild.clone(), Some(orphan_fei.clone()), participant("alpha"), Workitem::default());
    store.put(&waiting(leaf, Vec::new())).await.unwrap();

    let (engine, trace) = engine_over(store.clone());
    let mut waiter = engine.subscribe();

    let report = engine.recover().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            reapplied: 0,
            regenerated: 0,
            cancelled: 1,
            unrecoverable: 0
        }
    );

    let _workers = engine.start_workers();
    waiter
        .wait_until(WAIT, |e| e.action == LogAction::Cancel && e.fei.as_ref() == Some(&grandchild))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, async {
        while !store.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("orphaned branch removed");

    assert!(engine.errors("wf-orphan").is_empty());
    assert!(engine.process("wf-orphan").await.unwrap().is_none());
    assert!(trace.trace().is_empty());
    assert_eq!(engine.history().count("wf-orphan", LogAction::Terminated), 0);

    engine.shutdown();
}
