use arbor::dsl::builder::{define, participant};
use arbor::runtime::expression::FlowExpression;
use arbor::runtime::fei::FlowExpressionId;
use arbor::runtime::message::Message;
use arbor::runtime::storage::{
    ExpressionStore, InMemoryExpressionStore, InMemoryMessageQueue, MessageQueue,
};
use arbor::runtime::workitem::Workitem;

fn stored(fei: FlowExpressionId, parent: Option<FlowExpressionId>) -> FlowExpression {
    FlowExpression::new(fei, parent, define([participant("alpha")]), Workitem::default())
}

#[tokio::test]
async fn test_instance_bookkeeping_goes_with_its_last_expression() {
    let store = InMemoryExpressionStore::new();
    let root = FlowExpressionId::new_root("engine", "wf-prune");
    let sub_root = root.child(0).sub_process_root(0);

    store.put(&stored(root.clone(), None)).await.unwrap();
    store.put(&stored(sub_root.clone(), Some(root.child(0)))).await.unwrap();
    assert_eq!(store.next_subprocess_id("wf-prune").await.unwrap(), 0);
    assert_eq!(store.next_subprocess_id("wf-prune").await.unwrap(), 1);
    assert_eq!(store.instance_count(), 1);
    assert_eq!(store.len(), 2);

    // Sub-process expressions live under the top-level instance
    store.remove(&root).await.unwrap();
    assert_eq!(store.instance_count(), 1);
    assert_eq!(store.expressions_for("wf-prune_0").await.unwrap().len(), 1);

    store.remove(&sub_root).await.unwrap();
    assert!(store.is_empty());
    assert!(store.all_expressions().await.unwrap().is_empty());
    assert_eq!(store.next_subprocess_id("wf-prune").await.unwrap(), 0);
}

#[tokio::test]
async fn test_queue_accepts_pushes_past_its_soft_limit() {
    let queue = InMemoryMessageQueue::new(2);
    let root = FlowExpressionId::new_root("engine", "wf-queue");

    // No consumer running: a bounded queue would block on the third push
    for i in 0..10 {
        queue.push(Message::Apply { fei: root.child(i) }).await.unwrap();
    }
    assert_eq!(queue.len(), 10);

    let first = queue.pop().await.unwrap().unwrap();
    assert_eq!(first.fei(), &root.child(0));
    assert_eq!(queue.len(), 9);
}
