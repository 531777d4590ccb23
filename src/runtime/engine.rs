use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dsl::Tree;
use crate::error::FlowError;
use crate::nodes::participant::ParticipantNode;
use crate::nodes::standard_nodes;
use crate::participants::{Participant, ParticipantRegistry};
use crate::runtime::expression::{ChildRef, ExpressionState, FlowExpression};
use crate::runtime::fei::{FlowExpressionId, wfid_split};
use crate::runtime::history::{History, HistoryEvent, LogAction};
use crate::runtime::message::{Message, Outcome};
use crate::runtime::node::Node;
use crate::runtime::storage::{
    ExpressionStore, InMemoryExpressionStore, InMemoryMessageQueue, MessageQueue,
};
use crate::runtime::syscall::Syscall;
use crate::runtime::workitem::Workitem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Apply,
    Dispatch,
    Replay,
}

/// An error recorded against a process instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessError {
    pub fei: FlowExpressionId,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of a process instance: its live expressions (sub-processes
/// included) and the errors recorded against it.
#[derive(Debug, Clone)]
pub struct ProcessStatus {
    pub wfid: String,
    pub expressions: Vec<FlowExpression>,
    pub errors: Vec<ProcessError>,
}

impl ProcessStatus {
    pub fn expression(&self, fei: &FlowExpressionId) -> Option<&FlowExpression> {
        self.expressions.iter().find(|e| &e.fei == fei)
    }

    pub fn root_expression(&self) -> Option<&FlowExpression> {
        self.expressions
            .iter()
            .find(|e| e.fei.wfid() == self.wfid && e.fei.depth() == 0)
    }

    /// Walks parent links up from `fei` to the topmost expression still
    /// present. A detached branch is its own root.
    pub fn root_expression_for(&self, fei: &FlowExpressionId) -> Option<&FlowExpression> {
        let mut current = self.expression(fei)?;
        while let Some(parent) = current.parent.as_ref().and_then(|p| self.expression(p)) {
            current = parent;
        }
        Some(current)
    }

    pub fn is_errored(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Expressions found in `Applying` state and applied again.
    pub reapplied: usize,
    /// Children listed by a parent but missing from storage, rebuilt.
    pub regenerated: usize,
    /// Expressions whose parent is gone, cancelled along with their
    /// subtree.
    pub cancelled: usize,
    /// Gaps that could not be rebuilt; their instance is marked errored.
    pub unrecoverable: usize,
}

// --- Effects ---

#[derive(Debug)]
enum Effect {
    ApplyChild {
        position: usize,
        workitem: Workitem,
        detached: bool,
    },
    ApplySubprocess {
        definition: String,
        workitem: Workitem,
    },
    Reply(Workitem),
    Fail(String),
    Cancel(FlowExpressionId),
    Dispatch {
        participant: String,
        workitem: Workitem,
    },
    Withdraw(String),
}

#[derive(Debug, Default)]
struct EngineSyscall {
    effects: Vec<Effect>,
}

impl Syscall for EngineSyscall {
    fn apply_child(&mut self, position: usize, workitem: Workitem) {
        self.effects.push(Effect::ApplyChild {
            position,
            workitem,
            detached: false,
        });
    }

    fn apply_detached_child(&mut self, position: usize, workitem: Workitem) {
        self.effects.push(Effect::ApplyChild {
            position,
            workitem,
            detached: true,
        });
    }

    fn apply_subprocess(&mut self, definition: &str, workitem: Workitem) {
        self.effects.push(Effect::ApplySubprocess {
            definition: definition.to_string(),
            workitem,
        });
    }

    fn reply(&mut self, workitem: Workitem) {
        self.effects.push(Effect::Reply(workitem));
    }

    fn fail(&mut self, message: String) {
        self.effects.push(Effect::Fail(message));
    }

    fn cancel_child(&mut self, child: &FlowExpressionId) {
        self.effects.push(Effect::Cancel(child.clone()));
    }

    fn dispatch(&mut self, participant: &str, workitem: Workitem) {
        self.effects.push(Effect::Dispatch {
            participant: participant.to_string(),
            workitem,
        });
    }

    fn withdraw(&mut self, participant: &str) {
        self.effects.push(Effect::Withdraw(participant.to_string()));
    }

    fn wait(&mut self) {
        // Do nothing
    }
}

enum Finish {
    Reply(Workitem),
    Fail(String),
}

/// What a transition sends out once its writes are done.
#[derive(Default)]
struct Outbox {
    messages: Vec<Message>,
    cancels: Vec<FlowExpressionId>,
    dispatches: Vec<(String, Workitem)>,
    withdrawals: Vec<(String, FlowExpressionId)>,
}

type BoxedFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn ExpressionStore>,
    queue: Arc<dyn MessageQueue>,

    // Registry for expression behaviours, by name
    node_registry: HashMap<String, Arc<dyn Node>>,
    participants: ParticipantRegistry,
    // Named definitions for `subprocess`
    definitions: DashMap<String, Tree>,

    // One transition per identity at a time
    locks: DashMap<String, Arc<Mutex<()>>>,
    // Map<Fei, (Seq, Consume task)>, deliveries still running
    deliveries: Arc<DashMap<String, (u64, JoinHandle<()>)>>,
    delivery_seq: AtomicU64,

    history: Arc<History>,
    // Map<ParentWfid, Errors>
    errors: Arc<DashMap<String, Vec<ProcessError>>>,

    shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryExpressionStore::new());
        let queue = Arc::new(InMemoryMessageQueue::new(config.queue_capacity));
        Self::new_with_storage(config, store, queue)
    }

    pub fn new_with_storage(
        config: EngineConfig,
        store: Arc<dyn ExpressionStore>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let history = Arc::new(History::new(config.history_capacity));

        let mut engine = Self {
            config,
            store,
            queue,
            node_registry: HashMap::new(),
            participants: ParticipantRegistry::new(),
            definitions: DashMap::new(),
            locks: DashMap::new(),
            deliveries: Arc::new(DashMap::new()),
            delivery_seq: AtomicU64::new(0),
            history,
            errors: Arc::new(DashMap::new()),
            shutdown,
        };
        for node in standard_nodes() {
            engine.register_expression(node);
        }
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine_id(&self) -> &str {
        &self.config.engine_id
    }

    pub fn store(&self) -> Arc<dyn ExpressionStore> {
        self.store.clone()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Registers a behaviour under each of its names, replacing any
    /// previous holder.
    pub fn register_expression(&mut self, node: Arc<dyn Node>) {
        for name in node.names() {
            self.node_registry.insert(name.to_string(), node.clone());
        }
    }

    pub fn register_participant(
        &self,
        pattern: &str,
        participant: Arc<dyn Participant>,
    ) -> Result<()> {
        self.participants.register(pattern, participant)
    }

    /// Makes `tree` available to `subprocess` expressions as `name`.
    pub fn register_definition(&self, name: &str, tree: Tree) {
        self.definitions.insert(name.to_string(), tree);
    }

    // --- Launching and external messages ---

    pub async fn launch(&self, tree: Tree, fields: Map<String, Value>) -> Result<String> {
        let wfid = Self::new_wfid();
        self.launch_with_wfid(&wfid, tree, fields).await?;
        Ok(wfid)
    }

    /// Launches under a caller-chosen wfid. A wfid ending in `_<digits>`
    /// reads as a sub-process id everywhere; it is accepted with a warning.
    pub async fn launch_with_wfid(
        &self,
        wfid: &str,
        tree: Tree,
        fields: Map<String, Value>,
    ) -> Result<FlowExpressionId> {
        if wfid_split(wfid).1.is_some() {
            warn!(wfid, "wfid looks like a sub-process id");
        }

        let fei = FlowExpressionId::new_root(self.config.engine_id.clone(), wfid);
        if self.store.get(&fei).await?.is_some() {
            return Err(anyhow!("Process {} is already running", wfid));
        }

        let mut workitem = Workitem::new(fields);
        workitem.fei = Some(fei.clone());
        let root = FlowExpression::new(fei.clone(), None, tree, workitem);

        self.store.put(&root).await?;
        self.history
            .record(HistoryEvent::for_fei(LogAction::Launch, &fei).with_message(root.name()));
        self.queue.push(Message::Apply { fei: fei.clone() }).await?;

        info!(wfid, expression = %root.name(), "Process launched");
        Ok(fei)
    }

    /// Routes a participant's workitem back to its expression.
    pub async fn reply(&self, workitem: Workitem) -> Result<()> {
        let fei = workitem
            .fei
            .clone()
            .ok_or_else(|| anyhow!("Workitem carries no fei, can't route the reply"))?;
        self.queue.push(Message::Receive { fei, workitem }).await
    }

    /// Cancels `fei` and everything below it, right away rather than behind
    /// queued messages. The cancelled expression does not reply upward.
    pub async fn cancel(&self, fei: &FlowExpressionId) -> Result<()> {
        self.handle_message(Message::Cancel {
            fei: fei.clone(),
            from_parent: false,
        })
        .await
    }

    pub async fn cancel_process(&self, wfid: &str) -> Result<()> {
        let root = FlowExpressionId::new_root(self.config.engine_id.clone(), wfid);
        self.cancel(&root).await
    }

    /// Hands a participant expression's workitem to its participant again.
    pub async fn retry_dispatch(&self, fei: &FlowExpressionId) -> Result<()> {
        let exp = self
            .store
            .get(fei)
            .await?
            .ok_or_else(|| anyhow!("No expression at {}", fei))?;

        let waits_on_participant = exp.name() == "participant"
            || !self.node_registry.contains_key(exp.name());
        if exp.state != ExpressionState::Waiting || !waits_on_participant {
            return Err(anyhow!("{} is not waiting on a participant", fei));
        }

        let name = ParticipantNode::participant_name(&exp).to_string();
        self.dispatch(name, exp.applied_workitem.clone());
        Ok(())
    }

    // --- Queries ---

    pub async fn process(&self, wfid: &str) -> Result<Option<ProcessStatus>> {
        let expressions = self.store.expressions_for(wfid).await?;
        let errors = self.errors(wfid);
        if expressions.is_empty() && errors.is_empty() {
            return Ok(None);
        }
        Ok(Some(ProcessStatus {
            wfid: wfid.to_string(),
            expressions,
            errors,
        }))
    }

    pub fn errors(&self, wfid: &str) -> Vec<ProcessError> {
        let (top, _) = wfid_split(wfid);
        self.errors
            .get(top)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Subscribe before acting, then wait: no event can slip in between.
    pub fn subscribe(&self) -> Waiter {
        Waiter {
            receiver: self.history.subscribe(),
        }
    }

    // --- Workers ---

    pub async fn run_worker(&self) {
        let mut shutdown = self.shutdown.subscribe();
        info!("Worker started.");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let popped = tokio::select! {
                _ = shutdown.changed() => break,
                popped = self.queue.pop() => popped,
            };

            match popped {
                Ok(Some(message)) => {
                    let fei = message.fei().clone();
                    let action = message.action();
                    if let Err(e) = self.handle_message(message).await {
                        error!(fei = %fei, action, error = ?e, "Message failed");
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(error = ?e, "Failed to pop message");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("Worker stopped.");
    }

    /// Spawns `config.workers` worker loops.
    pub fn start_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|_| {
                let engine = self.clone();
                tokio::spawn(async move { engine.run_worker().await })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    // --- Recovery ---

    /// Replays from storage after a restart: re-applies expressions that
    /// never got past `Applying`, rebuilds children a parent lists but
    /// storage lacks, and cancels expressions whose parent is gone. Run it
    /// before starting workers.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let all = self.store.all_expressions().await?;
        let known: HashSet<String> = all.iter().map(|e| e.fei.to_storage_id()).collect();
        let mut report = RecoveryReport::default();

        for exp in &all {
            // The parent went away before cancelling it: finish the cancel.
            if let Some(parent) = exp.parent.as_ref().filter(|p| !known.contains(&p.to_storage_id())) {
                warn!(fei = %exp.fei, parent = %parent, "Orphaned expression, cancelling it");
                self.queue
                    .push(Message::Cancel {
                        fei: exp.fei.clone(),
                        from_parent: false,
                    })
                    .await?;
                report.cancelled += 1;
                continue;
            }

            if exp.state == ExpressionState::Applying {
                self.queue.push(Message::Apply { fei: exp.fei.clone() }).await?;
                report.reapplied += 1;
            }

            for child in &exp.children {
                if known.contains(&child.fei.to_storage_id()) {
                    continue;
                }
                let gap = FlowError::ReplayInconsistency {
                    parent: exp.fei.to_string(),
                    child: child.fei.to_string(),
                };

                match self.child_tree(exp, child) {
                    Some(tree) => {
                        warn!(fei = %child.fei, "{}, applying it again", gap);
                        let mut workitem = exp.applied_workitem.clone();
                        workitem.fei = Some(child.fei.clone());
                        let fresh = FlowExpression::new(
                            child.fei.clone(),
                            Some(exp.fei.clone()),
                            tree,
                            workitem,
                        );
                        self.store.put(&fresh).await?;
                        self.queue.push(Message::Apply { fei: child.fei.clone() }).await?;
                        report.regenerated += 1;
                    }
                    None => {
                        error!(fei = %child.fei, "{}, no tree to rebuild it from", gap);
                        self.record_error(&exp.fei, ErrorKind::Replay, gap.to_string());
                        report.unrecoverable += 1;
                    }
                }
            }
        }

        info!(
            reapplied = report.reapplied,
            regenerated = report.regenerated,
            cancelled = report.cancelled,
            unrecoverable = report.unrecoverable,
            "Recovery done"
        );
        Ok(report)
    }

    // --- Transitions ---

    /// Processes one message under the addressed identity's lock.
    /// Cancellations it triggers are carried out before returning.
    pub async fn handle_message(&self, message: Message) -> Result<()> {
        let fei = message.fei().clone();
        let transitioned = {
            let lock = self.lock_for(&fei);
            let _guard = lock.lock().await;
            self.transition(message).await
        };
        self.release_lock(&fei);
        let cancels = transitioned?;

        for child in cancels {
            let cancel = Message::Cancel {
                fei: child.clone(),
                from_parent: true,
            };
            if let Err(e) = self.handle_boxed(cancel).await {
                error!(fei = %child, error = ?e, "Cancel failed");
            }
        }
        Ok(())
    }

    fn handle_boxed(&self, message: Message) -> BoxedFuture<'_> {
        Box::pin(self.handle_message(message))
    }

    fn lock_for(&self, fei: &FlowExpressionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(fei.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn release_lock(&self, fei: &FlowExpressionId) {
        self.locks
            .remove_if(&fei.to_string(), |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn transition(&self, message: Message) -> Result<Vec<FlowExpressionId>> {
        let fei = message.fei().clone();
        let action = message.action();

        let Some(mut exp) = self.store.get(&fei).await? else {
            debug!(fei = %fei, action, "No such expression, message discarded");
            return Ok(Vec::new());
        };
        if exp.state.is_terminal() {
            debug!(fei = %fei, action, state = ?exp.state, "Expression is over, message discarded");
            return Ok(Vec::new());
        }

        let mut outbox = Outbox::default();
        let node = self.node_for(&exp.tree, matches!(message, Message::Apply { .. }));
        let loses = exp.tree.is_lose() || node.as_ref().is_ok_and(|n| n.loses());

        let syscall = match message {
            Message::Apply { .. } => {
                if exp.state != ExpressionState::Applying {
                    debug!(fei = %fei, "Already applied, duplicate discarded");
                    return Ok(Vec::new());
                }
                debug!(fei = %fei, expression = %exp.name(), "apply");
                self.history
                    .record(HistoryEvent::for_fei(LogAction::Apply, &fei).with_message(exp.name()));

                if exp.tree.is_forget() {
                    if let Some(parent) = exp.parent.take() {
                        exp.forgotten = true;
                        let workitem = exp.applied_workitem.clone();
                        self.send_reply(&exp, parent, workitem, Outcome::Completed, &mut outbox);
                    }
                }

                exp.state = ExpressionState::Waiting;
                self.run_behaviour(&mut exp, |exp, s| {
                    let node = node?;
                    node.validate(&exp.tree)?;
                    node.apply(exp, s)
                })
            }
            Message::Reply {
                from,
                workitem,
                outcome,
                ..
            } => {
                if exp.state != ExpressionState::Waiting {
                    debug!(fei = %fei, state = ?exp.state, "Not waiting, reply discarded");
                    return Ok(Vec::new());
                }
                let Some(child) = exp.remove_child(&from) else {
                    debug!(fei = %fei, from = %from, "Reply from a non-child, discarded");
                    return Ok(Vec::new());
                };
                self.run_behaviour(&mut exp, |exp, s| {
                    let node = node?;
                    match outcome {
                        Outcome::Failed { message } => node.child_failed(exp, &child, message, s),
                        Outcome::Completed | Outcome::Cancelled => {
                            node.reply(exp, &child, workitem, s)
                        }
                    }
                })
            }
            Message::Receive { workitem, .. } => {
                if exp.state != ExpressionState::Waiting {
                    debug!(fei = %fei, state = ?exp.state, "Not waiting, workitem discarded");
                    return Ok(Vec::new());
                }
                let mut event = HistoryEvent::for_fei(LogAction::Receive, &fei);
                if let Some(name) = &workitem.participant_name {
                    event = event.with_participant(name);
                }
                self.history.record(event);

                self.run_behaviour(&mut exp, |exp, s| node?.receive(exp, workitem, s))
            }
            Message::Cancel { from_parent, .. } => {
                // Detached since its former parent listed it.
                if from_parent && exp.forgotten {
                    debug!(fei = %fei, "Forgotten expression, parent cancel discarded");
                    return Ok(Vec::new());
                }
                return self.cancel_expression(exp, node, loses, from_parent, outbox).await;
            }
        };

        self.commit(exp, loses, syscall, outbox).await
    }

    async fn cancel_expression(
        &self,
        mut exp: FlowExpression,
        node: Result<Arc<dyn Node>>,
        loses: bool,
        from_parent: bool,
        mut outbox: Outbox,
    ) -> Result<Vec<FlowExpressionId>> {
        debug!(fei = %exp.fei, from_parent, "cancel");
        self.history.record(HistoryEvent::for_fei(LogAction::Cancel, &exp.fei));
        exp.state = ExpressionState::Cancelling;

        let mut syscall = EngineSyscall::default();
        let cancelled = match node {
            Ok(node) => node.cancel(&mut exp, &mut syscall),
            Err(e) => Err(e),
        };
        if let Err(e) = cancelled {
            warn!(fei = %exp.fei, error = ?e, "Cancel behaviour failed, cancelling children anyway");
            syscall = EngineSyscall::default();
            for child in &exp.children {
                syscall.cancel_child(&child.fei);
            }
        }

        for effect in syscall.effects {
            match effect {
                Effect::Cancel(child) => outbox.cancels.push(child),
                Effect::Withdraw(participant) => {
                    outbox.withdrawals.push((participant, exp.fei.clone()))
                }
                other => debug!(fei = %exp.fei, effect = ?other, "Ignored while cancelling"),
            }
        }
        for child in exp.children.drain(..) {
            if !outbox.cancels.contains(&child.fei) {
                outbox.cancels.push(child.fei);
            }
        }

        if from_parent && !loses {
            if let Some(parent) = exp.parent.clone() {
                let workitem = exp.applied_workitem.clone();
                self.send_reply(&exp, parent, workitem, Outcome::Cancelled, &mut outbox);
            }
        }
        exp.state = ExpressionState::Cancelled;
        self.store.remove(&exp.fei).await?;
        debug!(fei = %exp.fei, state = ?exp.state, "Expression removed");

        if exp.is_root() {
            self.terminated(&exp, None, "cancelled");
        }

        self.flush(&mut outbox).await?;
        Ok(outbox.cancels)
    }

    /// Runs one behaviour step. An error from the behaviour turns into a
    /// failure reported upward; nothing it asked for is carried out.
    fn run_behaviour<F>(&self, exp: &mut FlowExpression, step: F) -> EngineSyscall
    where
        F: FnOnce(&mut FlowExpression, &mut EngineSyscall) -> Result<()>,
    {
        let mut syscall = EngineSyscall::default();
        if let Err(e) = step(exp, &mut syscall) {
            let failure = FlowError::Apply {
                fei: exp.fei.to_string(),
                message: format!("{:#}", e),
            };
            error!(fei = %exp.fei, expression = %exp.name(), "{}", failure);
            syscall = EngineSyscall::default();
            syscall.fail(failure.to_string());
        }
        syscall
    }

    async fn commit(
        &self,
        mut exp: FlowExpression,
        loses: bool,
        syscall: EngineSyscall,
        mut outbox: Outbox,
    ) -> Result<Vec<FlowExpressionId>> {
        let mut created: Vec<FlowExpression> = Vec::new();
        let mut finish: Option<Finish> = None;

        for effect in syscall.effects {
            match effect {
                Effect::ApplyChild {
                    position,
                    workitem,
                    detached,
                } => match exp.tree.children.get(position).cloned() {
                    Some(tree) => {
                        created.push(Self::new_child(&mut exp, position, tree, workitem, detached))
                    }
                    None => {
                        let message = format!("{} has no child at position {}", exp.fei, position);
                        finish.get_or_insert(Finish::Fail(message));
                    }
                },
                Effect::ApplySubprocess {
                    definition,
                    workitem,
                } => match self.definitions.get(&definition).map(|t| t.value().clone()) {
                    Some(tree) => {
                        let n = self.store.next_subprocess_id(exp.fei.parent_wfid()).await?;
                        let fei = exp.fei.sub_process_root(n);
                        exp.children.push(ChildRef {
                            fei: fei.clone(),
                            position: 0,
                        });
                        let mut workitem = workitem;
                        workitem.fei = Some(fei.clone());
                        created.push(FlowExpression::new(fei, Some(exp.fei.clone()), tree, workitem));
                    }
                    None => {
                        let failure = FlowError::UnknownExpression(definition);
                        finish.get_or_insert(Finish::Fail(failure.to_string()));
                    }
                },
                Effect::Reply(workitem) => {
                    finish.get_or_insert(Finish::Reply(workitem));
                }
                Effect::Fail(message) => {
                    finish.get_or_insert(Finish::Fail(message));
                }
                Effect::Cancel(child) => {
                    exp.remove_child(&child);
                    outbox.cancels.push(child);
                }
                Effect::Dispatch {
                    participant,
                    workitem,
                } => outbox.dispatches.push((participant, workitem)),
                Effect::Withdraw(participant) => {
                    outbox.withdrawals.push((participant, exp.fei.clone()))
                }
            }
        }

        match finish {
            None => {
                exp.state = ExpressionState::Waiting;
                self.store.put(&exp).await?;
            }
            Some(_) if loses => {
                debug!(fei = %exp.fei, "Lost, nothing goes to the parent");
                exp.state = ExpressionState::Waiting;
                self.store.put(&exp).await?;
            }
            Some(Finish::Reply(workitem)) => {
                exp.state = ExpressionState::Replying;
                for child in exp.children.drain(..) {
                    outbox.cancels.push(child.fei);
                }

                // Detached children of a finishing expression are stored
                // before it goes away.
                for child in &created {
                    self.store.put(child).await?;
                }
                self.store.remove(&exp.fei).await?;

                match exp.parent.clone() {
                    Some(parent) => {
                        self.send_reply(&exp, parent, workitem, Outcome::Completed, &mut outbox);
                        exp.state = ExpressionState::Done;
                    }
                    None if exp.forgotten => {
                        info!(fei = %exp.fei, "Forgotten branch ceased");
                        self.history.record(
                            HistoryEvent::for_fei(LogAction::Ceased, &exp.fei).with_workitem(&workitem),
                        );
                        exp.state = ExpressionState::Forgotten;
                    }
                    None => {
                        self.terminated(&exp, Some(&workitem), "done");
                        exp.state = ExpressionState::Done;
                    }
                }
                debug!(fei = %exp.fei, state = ?exp.state, "Expression removed");
            }
            Some(Finish::Fail(message)) => {
                for child in exp.children.drain(..) {
                    outbox.cancels.push(child.fei);
                }

                match exp.parent.clone() {
                    Some(parent) => {
                        let outcome = Outcome::Failed {
                            message: message.clone(),
                        };
                        self.send_reply(&exp, parent, exp.applied_workitem.clone(), outcome, &mut outbox);
                        exp.state = ExpressionState::Done;
                        for child in &created {
                            self.store.put(child).await?;
                        }
                        self.store.remove(&exp.fei).await?;
                    }
                    None => {
                        // Root (or detached branch) failed: the instance is
                        // errored, the expression stays for inspection.
                        error!(fei = %exp.fei, "Process errored: {}", message);
                        exp.state = ExpressionState::Waiting;
                        self.store.put(&exp).await?;
                        self.record_error(&exp.fei, ErrorKind::Apply, message.clone());
                        self.history.record(
                            HistoryEvent::for_fei(LogAction::ErrorIntercepted, &exp.fei)
                                .with_message(message),
                        );
                    }
                }
            }
        }

        if exp.state == ExpressionState::Waiting {
            for child in &created {
                self.store.put(child).await?;
            }
        }
        for child in created {
            outbox.messages.push(Message::Apply { fei: child.fei });
        }

        self.flush(&mut outbox).await?;
        Ok(outbox.cancels)
    }

    fn new_child(
        exp: &mut FlowExpression,
        position: usize,
        tree: Tree,
        mut workitem: Workitem,
        detached: bool,
    ) -> FlowExpression {
        let fei = if detached {
            let fei = exp.fei.child(exp.created);
            exp.created += 1;
            fei
        } else {
            exp.register_child(position)
        };

        workitem.fei = Some(fei.clone());
        workitem.participant_name = None;

        let parent = if detached { None } else { Some(exp.fei.clone()) };
        let mut child = FlowExpression::new(fei, parent, tree, workitem);
        child.forgotten = detached;
        child
    }

    /// The tree a listed child was (or would have been) created from.
    fn child_tree(&self, exp: &FlowExpression, child: &ChildRef) -> Option<Tree> {
        if child.fei.wfid() != exp.fei.wfid() {
            let name = exp.tree.attr_str("ref")?;
            return self.definitions.get(name).map(|t| t.value().clone());
        }
        exp.tree.children.get(child.position).cloned()
    }

    fn node_for(&self, tree: &Tree, applying: bool) -> Result<Arc<dyn Node>> {
        if let Some(node) = self.node_registry.get(&tree.name) {
            return Ok(node.clone());
        }
        // Once applied, an expression stays a participant expression
        // whatever the registry holds now.
        if !applying || self.participants.lookup(&tree.name).is_some() {
            if let Some(node) = self.node_registry.get("participant") {
                return Ok(node.clone());
            }
        }
        Err(FlowError::UnknownExpression(tree.name.clone()).into())
    }

    fn send_reply(
        &self,
        exp: &FlowExpression,
        parent: FlowExpressionId,
        mut workitem: Workitem,
        outcome: Outcome,
        outbox: &mut Outbox,
    ) {
        workitem.fei = Some(exp.fei.clone());
        workitem.participant_name = None;

        let event = HistoryEvent::for_fei(LogAction::Reply, &exp.fei).with_message(match &outcome {
            Outcome::Completed => format!("to {}", parent),
            Outcome::Cancelled => format!("cancelled, to {}", parent),
            Outcome::Failed { message } => format!("failed, to {}: {}", parent, message),
        });
        self.history.record(event);

        outbox.messages.push(Message::Reply {
            fei: parent,
            from: exp.fei.clone(),
            workitem,
            outcome,
        });
    }

    fn terminated(&self, exp: &FlowExpression, workitem: Option<&Workitem>, how: &str) {
        info!(wfid = %exp.fei.wfid(), how, "Process terminated");
        self.errors.remove(exp.fei.parent_wfid());
        let mut event = HistoryEvent::for_fei(LogAction::Terminated, &exp.fei).with_message(how);
        if let Some(workitem) = workitem {
            event = event.with_workitem(workitem);
        }
        self.history.record(event);
    }

    fn record_error(&self, fei: &FlowExpressionId, kind: ErrorKind, message: String) {
        record_error(&self.errors, fei, kind, message);
    }

    async fn flush(&self, outbox: &mut Outbox) -> Result<()> {
        for message in outbox.messages.drain(..) {
            self.queue.push(message).await?;
        }
        for (participant, workitem) in outbox.dispatches.drain(..) {
            self.dispatch(participant, workitem);
        }
        for (participant, fei) in outbox.withdrawals.drain(..) {
            self.withdraw(participant, fei);
        }
        Ok(())
    }

    // --- Participant boundary ---

    /// Hands the workitem over on its own task; a slow participant never
    /// holds a worker. Failures are recorded, not retried.
    fn dispatch(&self, name: String, mut workitem: Workitem) {
        let Some(fei) = workitem.fei.clone() else {
            warn!(participant = %name, "Workitem without fei, not dispatched");
            return;
        };
        workitem.participant_name = Some(name.clone());

        let Some(participant) = self.participants.lookup(&name) else {
            let failure = FlowError::UnknownParticipant(name.clone());
            dispatch_failed(&self.history, &self.errors, &fei, &name, failure.to_string());
            return;
        };

        self.history.record(
            HistoryEvent::for_fei(LogAction::Dispatch, &fei)
                .with_participant(&name)
                .with_workitem(&workitem),
        );
        debug!(fei = %fei, participant = %name, "dispatch");

        let queue = self.queue.clone();
        let history = self.history.clone();
        let errors = self.errors.clone();
        let deliveries = self.deliveries.clone();
        let limit = self.config.dispatch_timeout();
        let key = fei.to_string();
        let seq = self.delivery_seq.fetch_add(1, Ordering::SeqCst);
        let (tracked_tx, tracked_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn({
            let key = key.clone();
            async move {
                // Tracked before it can untrack itself
                let _ = tracked_rx.await;
                let failure = match timeout(limit, participant.consume(workitem)).await {
                    Ok(Ok(Some(workitem))) => {
                        let received = Message::Receive {
                            fei: fei.clone(),
                            workitem,
                        };
                        if let Err(e) = queue.push(received).await {
                            error!(fei = %fei, "Failed to queue participant reply: {}", e);
                        }
                        None
                    }
                    Ok(Ok(None)) => None,
                    Ok(Err(e)) => Some(format!("{:#}", e)),
                    Err(_) => Some(format!("timed out after {:?}", limit)),
                };
                if let Some(message) = failure {
                    let failure = FlowError::Dispatch {
                        fei: fei.to_string(),
                        participant: name.clone(),
                        message,
                    };
                    dispatch_failed(&history, &errors, &fei, &name, failure.to_string());
                }
                deliveries.remove_if(&key, |_, (s, _)| *s == seq);
            }
        });

        self.deliveries.insert(key, (seq, handle));
        let _ = tracked_tx.send(());
    }

    /// Tells the participant its expression is gone, once any delivery to
    /// it has returned or timed out.
    fn withdraw(&self, name: String, fei: FlowExpressionId) {
        let Some(participant) = self.participants.lookup(&name) else {
            return;
        };
        let delivery = self.deliveries.remove(&fei.to_string());
        tokio::spawn(async move {
            if let Some((_, (_, handle))) = delivery {
                let _ = handle.await;
            }
            if let Err(e) = participant.cancel(&fei).await {
                warn!(fei = %fei, participant = %name, "Participant cancel failed: {:#}", e);
            }
        });
    }

    fn new_wfid() -> String {
        format!("{}-{}", Utc::now().format("%Y%m%d"), Uuid::new_v4().simple())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn record_error(
    errors: &DashMap<String, Vec<ProcessError>>,
    fei: &FlowExpressionId,
    kind: ErrorKind,
    message: String,
) {
    errors
        .entry(fei.parent_wfid().to_string())
        .or_default()
        .push(ProcessError {
            fei: fei.clone(),
            kind,
            message,
            at: Utc::now(),
        });
}

fn dispatch_failed(
    history: &History,
    errors: &DashMap<String, Vec<ProcessError>>,
    fei: &FlowExpressionId,
    participant: &str,
    message: String,
) {
    error!(fei = %fei, participant, "{}", message);
    record_error(errors, fei, ErrorKind::Dispatch, message.clone());
    history.record(
        HistoryEvent::for_fei(LogAction::DispatchError, fei)
            .with_participant(participant)
            .with_message(message),
    );
}

/// Waits on lifecycle events. Obtain one with `Engine::subscribe` before
/// launching so nothing is missed; each call consumes events in order.
pub struct Waiter {
    receiver: broadcast::Receiver<HistoryEvent>,
}

impl Waiter {
    /// Next `terminated`, `ceased` or `error_intercepted` event of `wfid`.
    pub async fn wait_for(&mut self, wfid: &str, limit: Duration) -> Result<HistoryEvent> {
        self.wait_until(limit, |e| {
            e.concerns(wfid)
                && matches!(
                    e.action,
                    LogAction::Terminated | LogAction::Ceased | LogAction::ErrorIntercepted
                )
        })
        .await
    }

    /// Next dispatch to the participant called `name`.
    pub async fn wait_for_participant(&mut self, name: &str, limit: Duration) -> Result<HistoryEvent> {
        self.wait_until(limit, |e| {
            e.action == LogAction::Dispatch && e.participant.as_deref() == Some(name)
        })
        .await
    }

    pub async fn wait_for_action(
        &mut self,
        wfid: &str,
        action: LogAction,
        limit: Duration,
    ) -> Result<HistoryEvent> {
        self.wait_until(limit, |e| e.action == action && e.concerns(wfid))
            .await
    }

    pub async fn wait_until<F>(&mut self, limit: Duration, predicate: F) -> Result<HistoryEvent>
    where
        F: Fn(&HistoryEvent) -> bool,
    {
        let receiver = &mut self.receiver;
        let waited = timeout(limit, async {
            loop {
                match receiver.recv().await {
                    Ok(event) if predicate(&event) => return Ok(event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Waiter lagged behind the history");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(anyhow!("History channel closed"));
                    }
                }
            }
        })
        .await;

        waited.map_err(|_| anyhow!("Timed out after {:?}", limit))?
    }
}
