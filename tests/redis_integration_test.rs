use arbor::config::EngineConfig;
use arbor::dsl::builder::{concurrence, define, participant};
use arbor::participants::builtin::TraceParticipant;
use arbor::runtime::engine::Engine;
use arbor::runtime::expression::FlowExpression;
use arbor::runtime::fei::FlowExpressionId;
use arbor::runtime::history::LogAction;
use arbor::runtime::redis_storage::{RedisExpressionStore, RedisMessageQueue};
use arbor::runtime::storage::ExpressionStore;
use arbor::runtime::workitem::Workitem;
use redis::Client;
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;

// REDIS_URL, or a local default
fn get_redis_client() -> Client {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/6".to_string());
    redis::Client::open(url).expect("Invalid Redis URL")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore] // Needs a running Redis
async fn test_redis_distributed_execution() {
    let client = get_redis_client();
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("Failed to connect to Redis");
    let _: () = redis::cmd("FLUSHDB")
        .query_async(&mut conn)
        .await
        .expect("Failed to flush db");

    let store = Arc::new(RedisExpressionStore::with_prefix(client.clone(), "arbor-test"));
    let queue = Arc::new(RedisMessageQueue::new(client.clone(), "arbor-test:queue".to_string()));
    let config = EngineConfig {
        workers: 3,
        ..EngineConfig::default()
    };

    let engine = Arc::new(Engine::new_with_storage(config, store.clone(), queue));
    let trace = Arc::new(TraceParticipant::new());
    engine.register_participant("alpha|bravo|charly", trace.clone()).unwrap();

    let mut waiter = engine.subscribe();
    let workers = engine.start_workers();

    let tree = define([
        concurrence([participant("alpha"), participant("bravo")]),
        participant("charly"),
    ]);
    let wfid = engine.launch(tree, Map::new()).await.unwrap();

    let event = waiter
        .wait_for(&wfid, Duration::from_secs(10))
        .await
        .expect("Process did not finish");
    assert_eq!(event.action, LogAction::Terminated);
    assert_eq!(trace.trace().len(), 3);
    assert!(store.expressions_for(&wfid).await.unwrap().is_empty());

    // A finished instance leaves nothing to rescan
    let tracked: bool = redis::cmd("SISMEMBER")
        .arg("arbor-test:instances")
        .arg(&wfid)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(!tracked);
    assert!(store.all_expressions().await.unwrap().is_empty());

    engine.shutdown();
    for w in workers {
        w.await.unwrap();
    }
}

#[tokio::test]
#[ignore] // Needs a running Redis
async fn test_redis_subprocess_counter() {
    let client = get_redis_client();
    let store = RedisExpressionStore::with_prefix(client, "arbor-test-counter");
    let wfid = format!("wf-{}", uuid::Uuid::new_v4().simple());

    assert_eq!(store.next_subprocess_id(&wfid).await.unwrap(), 0);
    assert_eq!(store.next_subprocess_id(&wfid).await.unwrap(), 1);
}

#[tokio::test]
#[ignore] // Needs a running Redis
async fn test_redis_counter_goes_with_the_last_expression() {
    let client = get_redis_client();
    let store = RedisExpressionStore::with_prefix(client, "arbor-test-prune");
    let wfid = format!("wf-{}", uuid::Uuid::new_v4().simple());
    let root = FlowExpressionId::new_root("engine", wfid.as_str());
    let exp = FlowExpression::new(root.clone(), None, define([participant("alpha")]), Workitem::default());

    store.put(&exp).await.unwrap();
    assert_eq!(store.next_subprocess_id(&wfid).await.unwrap(), 0);
    assert_eq!(store.next_subprocess_id(&wfid).await.unwrap(), 1);

    store.remove(&root).await.unwrap();
    assert!(store.expressions_for(&wfid).await.unwrap().is_empty());
    assert_eq!(store.next_subprocess_id(&wfid).await.unwrap(), 0);
}
