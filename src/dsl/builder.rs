use crate::dsl::Tree;
use serde_json::{Map, Value};

impl Tree {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attributes: Map::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn child(mut self, child: Tree) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Tree>) -> Self {
        self.children.extend(children);
        self
    }

    /// Shorthand for `attr("forget", true)`.
    pub fn forget(self) -> Self {
        self.attr("forget", true)
    }

    /// Shorthand for `attr("lose", true)`.
    pub fn lose(self) -> Self {
        self.attr("lose", true)
    }
}

/// Root of a process definition; behaves as a sequence.
pub fn define(children: impl IntoIterator<Item = Tree>) -> Tree {
    Tree::new("define").children(children)
}

pub fn sequence(children: impl IntoIterator<Item = Tree>) -> Tree {
    Tree::new("sequence").children(children)
}

pub fn concurrence(children: impl IntoIterator<Item = Tree>) -> Tree {
    Tree::new("concurrence").children(children)
}

pub fn cursor(children: impl IntoIterator<Item = Tree>) -> Tree {
    Tree::new("cursor").children(children)
}

pub fn participant(name: &str) -> Tree {
    Tree::new(name)
}
