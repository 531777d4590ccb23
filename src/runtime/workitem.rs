use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::runtime::fei::FlowExpressionId;

/// Field under which command expressions (`rewind`, `break`) leave their
/// instruction for the enclosing cursor.
pub const COMMAND_FIELD: &str = "__command__";

/// The payload travelling down through apply and up through reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workitem {
    /// The expression currently holding this workitem.
    pub fei: Option<FlowExpressionId>,
    pub fields: Map<String, Value>,
    /// Set while the workitem sits with a participant.
    pub participant_name: Option<String>,
}

impl Workitem {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fei: None,
            fields,
            participant_name: None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn command(&self) -> Option<Command> {
        self.fields
            .get(COMMAND_FIELD)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_command(&mut self, command: Command) {
        if let Ok(v) = serde_json::to_value(command) {
            self.fields.insert(COMMAND_FIELD.to_string(), v);
        }
    }

    pub fn take_command(&mut self) -> Option<Command> {
        let command = self.command();
        self.fields.remove(COMMAND_FIELD);
        command
    }

    /// Copies `other`'s fields over this one's. With `keep_existing` the
    /// fields already present win.
    pub fn merge_from(&mut self, other: &Workitem, keep_existing: bool) {
        for (k, v) in &other.fields {
            if keep_existing && self.fields.contains_key(k) {
                continue;
            }
            self.fields.insert(k.clone(), v.clone());
        }
    }
}

/// Cursor control left in a workitem by a command expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Rewind,
    Break,
}
