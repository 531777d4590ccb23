use arbor::dsl::Tree;
use arbor::dsl::builder::{cursor, define, participant, sequence};
use arbor::participants::builtin::{BlockParticipant, NullParticipant, TraceParticipant};
use arbor::runtime::engine::Engine;
use arbor::runtime::history::LogAction;
use arbor::runtime::workitem::Command;
use serde_json::{Map, json};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn dispatches_to(engine: &Engine, name: &str) -> Vec<String> {
    engine
        .history()
        .by_action(LogAction::Dispatch)
        .into_iter()
        .filter(|e| e.participant.as_deref() == Some(name))
        .filter_map(|e| e.fei.map(|f| f.expid().to_string()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rewind_reapplies_with_fresh_ids() {
    let engine = Arc::new(Engine::new());
    engine
        .register_participant("alpha", Arc::new(TraceParticipant::new()))
        .unwrap();
    engine
        .register_participant(
            "bravo",
            Arc::new(BlockParticipant::new(|wi| {
                if wi.field("visited").is_none() {
                    wi.set_field("visited", true);
                    wi.set_command(Command::Rewind);
                }
                Ok(())
            })),
        )
        .unwrap();

    let mut waiter = engine.subscribe();
    let _workers = engine.start_workers();

    let tree = define([cursor([participant("alpha"), participant("bravo")])]);
    let wfid = engine.launch(tree, Map::new()).await.unwrap();

    let event = waiter.wait_for(&wfid, WAIT).await.unwrap();
    assert_eq!(event.action, LogAction::Terminated);

    let alphas = dispatches_to(&engine, "alpha");
    assert_eq!(alphas, vec!["0_0_0", "0_0_2"]);
    assert_eq!(dispatches_to(&engine, "bravo"), vec!["0_0_1", "0_0_3"]);

    // The command does not leak out of the cursor
    let fields = event.workitem.unwrap().fields;
    assert_eq!(fields.get("visited"), Some(&json!(true)));
    assert!(!fields.contains_key(arbor::runtime::workitem::COMMAND_FIELD));

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_break_skips_remaining_children() {
    let engine = Arc::new(Engine::new());
    let trace = Arc::new(TraceParticipant::new());
    engine.register_participant("alpha|bravo|charly", trace.clone()).unwrap();

    let mut waiter = engine.subscribe();
    let _workers = engine.start_workers();

    let tree = define([
        cursor([
            sequence([participant("alpha"), Tree::new("break"), participant("bravo")]),
            participant("bravo"),
        ]),
        participant("charly"),
    ]);
    let wfid = engine.launch(tree, Map::new()).await.unwrap();

    waiter.wait_for(&wfid, WAIT).await.unwrap();
    assert_eq!(trace.trace(), vec!["alpha", "charly"]);

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loop_runs_until_break() {
    let engine = Arc::new(Engine::new());
    engine
        .register_participant(
            "counter",
            Arc::new(BlockParticipant::new(|wi| {
                let n = wi.field("n").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
                wi.set_field("n", n);
                if n >= 3 {
                    wi.set_command(Command::Break);
                }
                Ok(())
            })),
        )
        .unwrap();

    let mut waiter = engine.subscribe();
    let _workers = engine.start_workers();

    let tree = define([Tree::new("loop").child(participant("counter"))]);
    let wfid = engine.launch(tree, Map::new()).await.unwrap();

    let event = waiter.wait_for(&wfid, WAIT).await.unwrap();
    assert_eq!(event.workitem.unwrap().field("n"), Some(&json!(3)));
    assert_eq!(dispatches_to(&engine, "counter").len(), 3);

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rewind_over_forgotten_task_loops_until_cancelled() {
    let engine = Arc::new(Engine::new());
    engine
        .register_participant("task_null", Arc::new(NullParticipant))
        .unwrap();
    engine
        .register_participant("task_ok", Arc::new(TraceParticipant::new()))
        .unwrap();

    let mut waiter = engine.subscribe();
    let _workers = engine.start_workers();

    let tree = define([cursor([
        participant("task_null").forget(),
        participant("task_ok"),
        Tree::new("rewind"),
    ])]);
    let wfid = engine.launch(tree, Map::new()).await.unwrap();

    for _ in 0..3 {
        waiter.wait_for_participant("task_ok", WAIT).await.unwrap();
    }

    let nulls = dispatches_to(&engine, "task_null");
    assert!(nulls.len() >= 3);
    // Every incarnation has its own identity, none was overwritten
    let mut unique = nulls.clone();
    unique.dedup();
    assert_eq!(unique, nulls);
    assert_eq!(&nulls[..2], &["0_0_0".to_string(), "0_0_3".to_string()]);

    engine.cancel_process(&wfid).await.unwrap();
    let status = engine.process(&wfid).await.unwrap().expect("forgotten tasks remain");
    assert!(status.root_expression().is_none());
    assert!(status.expressions.iter().all(|e| e.name() == "task_null" && e.forgotten));

    engine.shutdown();
}
