use async_trait::async_trait;
use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

use crate::runtime::expression::FlowExpression;
use crate::runtime::fei::{FlowExpressionId, wfid_split};
use crate::runtime::message::Message;

// --- Interfaces ---

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn push(&self, message: Message) -> Result<()>;
    /// Waits for the next message. `None` when the queue is closed or the
    /// implementation's poll interval ran out.
    async fn pop(&self) -> Result<Option<Message>>;
}

/// Durable expression state, keyed by `FlowExpressionId::to_storage_id`.
/// Every write is atomic per key; nothing spans keys.
#[async_trait]
pub trait ExpressionStore: Send + Sync {
    async fn put(&self, exp: &FlowExpression) -> Result<()>;
    async fn get(&self, fei: &FlowExpressionId) -> Result<Option<FlowExpression>>;
    async fn remove(&self, fei: &FlowExpressionId) -> Result<()>;

    /// Every expression of the top-level instance `wfid`, sub-processes
    /// included, ordered by sub-process then position.
    async fn expressions_for(&self, wfid: &str) -> Result<Vec<FlowExpression>>;

    async fn all_expressions(&self) -> Result<Vec<FlowExpression>>;

    /// Atomically hands out the next sub-process number for an instance.
    async fn next_subprocess_id(&self, wfid: &str) -> Result<u64>;
}

/// Ordering used when listing an instance: sub-process, then expid path.
pub fn sort_expressions(exps: &mut [FlowExpression]) {
    exps.sort_by(|a, b| {
        let ka = (a.fei.sub_wfid().map(|s| s.parse::<u64>().unwrap_or(0)), a.fei.expid_path());
        let kb = (b.fei.sub_wfid().map(|s| s.parse::<u64>().unwrap_or(0)), b.fei.expid_path());
        ka.cmp(&kb)
    });
}

// --- In-Memory Implementations ---

/// Unbounded: workers push follow-up messages into the queue they drain,
/// so a push must never wait on a consumer. `soft_limit` only warns.
pub struct InMemoryMessageQueue {
    sender: mpsc::UnboundedSender<Message>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    pending: AtomicUsize,
    soft_limit: usize,
}

impl InMemoryMessageQueue {
    pub fn new(soft_limit: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: tx,
            receiver: tokio::sync::Mutex::new(rx),
            pending: AtomicUsize::new(0),
            soft_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn push(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|e| anyhow::anyhow!("Message channel closed: {}", e))?;
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if pending == self.soft_limit + 1 {
            warn!(pending, limit = self.soft_limit, "Message queue over its soft limit");
        }
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Message>> {
        let mut rx = self.receiver.lock().await;
        let message = rx.recv().await;
        if message.is_some() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(message)
    }
}

/// Expressions grouped by top-level instance. An instance's entry and its
/// sub-process counter go away with its last expression.
#[derive(Default)]
pub struct InMemoryExpressionStore {
    // Map<ParentWfid, Map<StorageId, Expression>>
    instances: DashMap<String, HashMap<String, FlowExpression>>,
    // Map<ParentWfid, Counter>
    subprocess_ids: DashMap<String, AtomicU64>,
}

impl InMemoryExpressionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.iter().map(|i| i.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances with at least one stored expression.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[async_trait]
impl ExpressionStore for InMemoryExpressionStore {
    async fn put(&self, exp: &FlowExpression) -> Result<()> {
        self.instances
            .entry(exp.fei.parent_wfid().to_string())
            .or_default()
            .insert(exp.fei.to_storage_id(), exp.clone());
        Ok(())
    }

    async fn get(&self, fei: &FlowExpressionId) -> Result<Option<FlowExpression>> {
        Ok(self
            .instances
            .get(fei.parent_wfid())
            .and_then(|exps| exps.get(&fei.to_storage_id()).cloned()))
    }

    async fn remove(&self, fei: &FlowExpressionId) -> Result<()> {
        let top = fei.parent_wfid();
        if let Some(mut exps) = self.instances.get_mut(top) {
            exps.remove(&fei.to_storage_id());
        }
        if self.instances.remove_if(top, |_, exps| exps.is_empty()).is_some() {
            self.subprocess_ids.remove(top);
        }
        Ok(())
    }

    async fn expressions_for(&self, wfid: &str) -> Result<Vec<FlowExpression>> {
        let (top, _) = wfid_split(wfid);
        let mut exps: Vec<FlowExpression> = self
            .instances
            .get(top)
            .map(|exps| exps.values().cloned().collect())
            .unwrap_or_default();
        sort_expressions(&mut exps);
        Ok(exps)
    }

    async fn all_expressions(&self) -> Result<Vec<FlowExpression>> {
        Ok(self
            .instances
            .iter()
            .flat_map(|exps| exps.value().values().cloned().collect::<Vec<_>>())
            .collect())
    }

    async fn next_subprocess_id(&self, wfid: &str) -> Result<u64> {
        let next = self
            .subprocess_ids
            .entry(wfid.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }
}
