use serde::{Deserialize, Serialize};

use crate::runtime::fei::FlowExpressionId;
use crate::runtime::workitem::Workitem;

/// How a child finished, as seen by its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Cancelled,
    Failed { message: String },
}

/// A unit of work on the queue, always addressed to one expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Message {
    /// Evaluate an expression already persisted in `Applying` state.
    Apply { fei: FlowExpressionId },
    /// A child (`from`) reports to its parent (`fei`).
    Reply {
        fei: FlowExpressionId,
        from: FlowExpressionId,
        workitem: Workitem,
        outcome: Outcome,
    },
    /// A participant hands a workitem back to its expression.
    Receive {
        fei: FlowExpressionId,
        workitem: Workitem,
    },
    /// `from_parent` is false at the cancellation root, which terminates
    /// without replying.
    Cancel {
        fei: FlowExpressionId,
        from_parent: bool,
    },
}

impl Message {
    pub fn fei(&self) -> &FlowExpressionId {
        match self {
            Message::Apply { fei }
            | Message::Reply { fei, .. }
            | Message::Receive { fei, .. }
            | Message::Cancel { fei, .. } => fei,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Message::Apply { .. } => "apply",
            Message::Reply { .. } => "reply",
            Message::Receive { .. } => "receive",
            Message::Cancel { .. } => "cancel",
        }
    }
}
