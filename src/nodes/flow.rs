use anyhow::{Result, anyhow};
use tracing::debug;

use crate::dsl::Tree;
use crate::runtime::expression::{ChildRef, FlowExpression};
use crate::runtime::node::Node;
use crate::runtime::syscall::Syscall;
use crate::runtime::workitem::{Command, Workitem};

// --- SEQUENCE NODE ---

/// Applies its children one after the other and replies after the last.
#[derive(Debug)]
pub struct SequenceNode;

impl Node for SequenceNode {
    fn names(&self) -> &'static [&'static str] {
        &["sequence", "define", "process_definition"]
    }

    fn apply(&self, exp: &mut FlowExpression, syscall: &mut dyn Syscall) -> Result<()> {
        let workitem = exp.applied_workitem.clone();
        if exp.tree.children.is_empty() {
            syscall.reply(workitem);
        } else {
            syscall.apply_child(0, workitem);
        }
        Ok(())
    }

    fn reply(
        &self,
        exp: &mut FlowExpression,
        from: &ChildRef,
        workitem: Workitem,
        syscall: &mut dyn Syscall,
    ) -> Result<()> {
        // A pending cursor command short-circuits to the enclosing cursor.
        if workitem.command().is_some() {
            syscall.reply(workitem);
            return Ok(());
        }

        let next = from.position + 1;
        if next < exp.tree.children.len() {
            syscall.apply_child(next, workitem);
        } else {
            syscall.reply(workitem);
        }
        Ok(())
    }
}

// --- CURSOR NODE ---

/// A sequence that obeys `rewind` and `break` commands. As `loop`, it
/// rewinds by itself after the last child.
#[derive(Debug)]
pub struct CursorNode;

impl CursorNode {
    fn loops(exp: &FlowExpression) -> bool {
        exp.name() == "loop"
    }
}

impl Node for CursorNode {
    fn names(&self) -> &'static [&'static str] {
        &["cursor", "loop"]
    }

    fn apply(&self, exp: &mut FlowExpression, syscall: &mut dyn Syscall) -> Result<()> {
        let workitem = exp.applied_workitem.clone();
        if exp.tree.children.is_empty() {
            syscall.reply(workitem);
        } else {
            syscall.apply_child(0, workitem);
        }
        Ok(())
    }

    fn reply(
        &self,
        exp: &mut FlowExpression,
        from: &ChildRef,
        mut workitem: Workitem,
        syscall: &mut dyn Syscall,
    ) -> Result<()> {
        let next = match workitem.take_command() {
            Some(Command::Break) => None,
            Some(Command::Rewind) => Some(0),
            None if from.position + 1 < exp.tree.children.len() => Some(from.position + 1),
            None if Self::loops(exp) => Some(0),
            None => None,
        };

        match next {
            Some(position) => {
                debug!(fei = %exp.fei, position, "cursor moving");
                syscall.apply_child(position, workitem);
            }
            None => syscall.reply(workitem),
        }
        Ok(())
    }
}

// --- CONCURRENCE NODE ---

/// Applies all its children at once and replies once `count` of them
/// (all by default) have replied, in arrival order. The children still
/// running at that point are cancelled.
#[derive(Debug)]
pub struct ConcurrenceNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Merge {
    /// Earlier arrivals win field conflicts.
    First,
    /// Later arrivals win field conflicts.
    Last,
}

impl ConcurrenceNode {
    fn required(tree: &Tree) -> usize {
        let declared = tree.children.len();
        tree.attr_usize("count")
            .map(|c| c.clamp(1, declared.max(1)))
            .unwrap_or(declared)
    }

    fn merge(tree: &Tree) -> Merge {
        match tree.attr_str("merge") {
            Some("last") => Merge::Last,
            _ => Merge::First,
        }
    }

    fn joined(exp: &FlowExpression) -> usize {
        exp.data
            .get("joined")
            .and_then(|v| v.as_u64())
            .map_or(0, |n| n as usize)
    }
}

impl Node for ConcurrenceNode {
    fn names(&self) -> &'static [&'static str] {
        &["concurrence"]
    }

    fn validate(&self, tree: &Tree) -> Result<()> {
        if tree.attribute("count").is_some() && tree.attr_usize("count").is_none() {
            return Err(anyhow!(
                "concurrence 'count' must be a non-negative integer, got {:?}",
                tree.attribute("count")
            ));
        }
        match tree.attr_str("merge") {
            None | Some("first") | Some("last") => {}
            Some(other) => return Err(anyhow!("unknown concurrence merge '{}'", other)),
        }
        Ok(())
    }

    fn apply(&self, exp: &mut FlowExpression, syscall: &mut dyn Syscall) -> Result<()> {
        let workitem = exp.applied_workitem.clone();
        if exp.tree.children.is_empty() {
            syscall.reply(workitem);
            return Ok(());
        }

        exp.set_data("joined", 0);
        for position in 0..exp.tree.children.len() {
            syscall.apply_child(position, workitem.clone());
        }
        Ok(())
    }

    fn reply(
        &self,
        exp: &mut FlowExpression,
        _from: &ChildRef,
        workitem: Workitem,
        syscall: &mut dyn Syscall,
    ) -> Result<()> {
        // Only the running merge is kept, not every reply
        let mut merged: Workitem = match exp.data.remove("merged") {
            Some(v) => serde_json::from_value(v)?,
            None => Workitem::default(),
        };
        merged.merge_from(&workitem, Self::merge(&exp.tree) == Merge::First);
        let joined = Self::joined(exp) + 1;

        if joined < Self::required(&exp.tree) {
            exp.set_data("joined", joined);
            exp.set_data("merged", serde_json::to_value(&merged)?);
            syscall.wait();
            return Ok(());
        }

        for child in &exp.children {
            syscall.cancel_child(&child.fei);
        }
        syscall.reply(merged);
        Ok(())
    }
}
