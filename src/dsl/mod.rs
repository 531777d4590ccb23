pub mod builder;
pub mod loader;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One node of a process definition: an expression name, its attributes
/// and its (statically declared) children.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub name: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<Tree>,
}

impl Tree {
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Accepts numbers and numeric strings.
    pub fn attr_usize(&self, key: &str) -> Option<usize> {
        match self.attributes.get(key)? {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn attr_truthy(&self, key: &str) -> bool {
        self.attributes.get(key).is_some_and(is_truthy)
    }

    pub fn is_forget(&self) -> bool {
        self.attr_truthy("forget")
    }

    pub fn is_lose(&self) -> bool {
        self.attr_truthy("lose")
    }
}

/// `true`, `"true"`, `"yes"` and non-zero numbers are truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}
