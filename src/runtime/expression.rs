use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dsl::Tree;
use crate::runtime::fei::FlowExpressionId;
use crate::runtime::workitem::Workitem;

/// Lifecycle of a stored expression.
///
/// Only `Applying` and `Waiting` survive a transition in storage; the
/// other states are reached inside a transition, logged, and the
/// expression is then removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionState {
    /// Persisted by its parent, apply not yet processed.
    Applying,
    /// Applied, waiting on children or on a participant.
    Waiting,
    Replying,
    Cancelling,
    Cancelled,
    /// Detached expression that finished; its reply went nowhere.
    Forgotten,
    Done,
}

impl ExpressionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExpressionState::Cancelled | ExpressionState::Forgotten | ExpressionState::Done
        )
    }
}

/// A child created by an expression: its identity and the position of its
/// tree among the parent's declared children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRef {
    pub fei: FlowExpressionId,
    pub position: usize,
}

/// Durable state of one node of a process instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExpression {
    pub fei: FlowExpressionId,
    /// Back reference by identity. `None` for a root or a detached
    /// (forgotten) expression.
    pub parent: Option<FlowExpressionId>,
    /// Live children, in creation order.
    pub children: Vec<ChildRef>,
    /// How many children were ever created; the next child's index.
    pub created: usize,
    pub tree: Tree,
    pub applied_workitem: Workitem,
    pub state: ExpressionState,
    /// Detached from its parent by `forget`.
    pub forgotten: bool,
    /// Behaviour-private state (join count, merged workitem...).
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl FlowExpression {
    pub fn new(
        fei: FlowExpressionId,
        parent: Option<FlowExpressionId>,
        tree: Tree,
        workitem: Workitem,
    ) -> Self {
        Self {
            fei,
            parent,
            children: Vec::new(),
            created: 0,
            tree,
            applied_workitem: workitem,
            state: ExpressionState::Applying,
            forgotten: false,
            data: Map::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.tree.name
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none() && !self.forgotten
    }

    pub fn has_child(&self, fei: &FlowExpressionId) -> bool {
        self.children.iter().any(|c| &c.fei == fei)
    }

    pub fn remove_child(&mut self, fei: &FlowExpressionId) -> Option<ChildRef> {
        let idx = self.children.iter().position(|c| &c.fei == fei)?;
        Some(self.children.remove(idx))
    }

    /// Allocates the identity for a new child at tree `position`.
    pub fn register_child(&mut self, position: usize) -> FlowExpressionId {
        let fei = self.fei.child(self.created);
        self.created += 1;
        self.children.push(ChildRef {
            fei: fei.clone(),
            position,
        });
        fei
    }

    pub fn set_data(&mut self, key: &str, value: impl Into<Value>) {
        self.data.insert(key.to_string(), value.into());
    }
}
