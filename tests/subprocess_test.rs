use arbor::dsl::Tree;
use arbor::dsl::builder::{define, participant};
use arbor::participants::builtin::{StorageParticipant, TraceParticipant};
use arbor::runtime::engine::Engine;
use arbor::runtime::history::LogAction;
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subprocess_runs_under_derived_wfid() {
    let engine = Arc::new(Engine::new());
    let trace = Arc::new(TraceParticipant::new());
    engine.register_participant("alpha|bravo|charly", trace.clone()).unwrap();
    engine.register_definition("review", define([participant("bravo")]));

    let mut waiter = engine.subscribe();
    let _workers = engine.start_workers();

    let tree = define([
        participant("alpha"),
        Tree::new("subprocess").attr("ref", "review"),
        participant("charly"),
    ]);
    let wfid = engine.launch(tree, Map::new()).await.unwrap();

    let event = waiter.wait_for(&wfid, WAIT).await.unwrap();
    assert_eq!(event.action, LogAction::Terminated);
    assert_eq!(event.wfid, wfid);
    assert_eq!(trace.trace(), vec!["alpha", "bravo", "charly"]);

    let bravo = engine
        .history()
        .by_action(LogAction::Dispatch)
        .into_iter()
        .find(|e| e.participant.as_deref() == Some("bravo"))
        .and_then(|e| e.fei)
        .unwrap();
    assert_eq!(bravo.wfid(), format!("{}_0", wfid));
    assert_eq!(bravo.parent_wfid(), wfid);
    assert_eq!(bravo.sub_wfid(), Some("0"));
    assert_eq!(bravo.expid(), "0_0");

    // The sub-process root does not terminate the instance
    assert_eq!(engine.history().count(&wfid, LogAction::Terminated), 1);

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subprocess_expressions_belong_to_the_instance() {
    let engine = Arc::new(Engine::new());
    let storage = Arc::new(StorageParticipant::new());
    engine.register_participant("bravo", storage.clone()).unwrap();
    engine.register_definition("review", define([participant("bravo")]));

    let mut waiter = engine.subscribe();
    let _workers = engine.start_workers();

    let tree = define([Tree::new("subprocess").attr("ref", "review")]);
    let wfid = engine.launch(tree, Map::new()).await.unwrap();
    let bravo = waiter.wait_for_participant("bravo", WAIT).await.unwrap();
    let bravo_fei = bravo.fei.unwrap();

    let status = engine.process(&wfid).await.unwrap().unwrap();
    // root, subprocess, sub root, bravo
    assert_eq!(status.expressions.len(), 4);
    assert_eq!(status.root_expression_for(&bravo_fei).unwrap().fei.wfid(), wfid);

    // Sub-process view resolves to the same instance
    let sub = engine.process(bravo_fei.wfid()).await.unwrap().unwrap();
    assert_eq!(sub.expressions.len(), 4);

    engine.cancel_process(&wfid).await.unwrap();
    assert!(engine.process(&wfid).await.unwrap().is_none());

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_definition_errors() {
    let engine = Arc::new(Engine::new());
    let mut waiter = engine.subscribe();
    let _workers = engine.start_workers();

    let tree = define([Tree::new("subprocess").attr("ref", "missing")]);
    let wfid = engine.launch(tree, Map::new()).await.unwrap();

    let event = waiter.wait_for(&wfid, WAIT).await.unwrap();
    assert_eq!(event.action, LogAction::ErrorIntercepted);
    assert!(engine.errors(&wfid)[0].message.contains("missing"));

    engine.shutdown();
}
