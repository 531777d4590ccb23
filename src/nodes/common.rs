use anyhow::Result;

use crate::runtime::expression::{ChildRef, FlowExpression};
use crate::runtime::node::Node;
use crate::runtime::syscall::Syscall;
use crate::runtime::workitem::{Command, Workitem};

/// Applies its first child if any, else replies at once. Forwards the
/// child's reply unchanged.
#[derive(Debug)]
pub struct PassNode;

impl Node for PassNode {
    fn names(&self) -> &'static [&'static str] {
        &["pass", "noop"]
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
        _exp: &mut FlowExpression,
        _from: &ChildRef,
        workitem: Workitem,
        syscall: &mut dyn Syscall,
    ) -> Result<()> {
        syscall.reply(workitem);
        Ok(())
    }
}

/// Never replies to its parent. Applies its first child, if any, and just
/// sits there until cancelled.
///
/// ```yaml
/// name: concurrence
/// attributes: { count: 1 }
/// children:
///   - name: alfred
///   - name: lose
///     children:
///       - name: send_reminder
/// ```
///
/// The concurrence above is only over when alfred replies.
#[derive(Debug)]
pub struct LoseNode;

impl Node for LoseNode {
    fn names(&self) -> &'static [&'static str] {
        &["lose"]
    }

    fn apply(&self, exp: &mut FlowExpression, syscall: &mut dyn Syscall) -> Result<()> {
        if exp.tree.children.is_empty() {
            syscall.wait();
        } else {
            syscall.apply_child(0, exp.applied_workitem.clone());
        }
        Ok(())
    }

    fn reply(
        &self,
        _exp: &mut FlowExpression,
        _from: &ChildRef,
        _workitem: Workitem,
        syscall: &mut dyn Syscall,
    ) -> Result<()> {
        syscall.wait();
        Ok(())
    }

    fn loses(&self) -> bool {
        true
    }

    fn child_failed(
        &self,
        _exp: &mut FlowExpression,
        _from: &ChildRef,
        _message: String,
        syscall: &mut dyn Syscall,
    ) -> Result<()> {
        syscall.wait();
        Ok(())
    }
}

/// Applies its child detached and replies to its parent immediately. The
/// child runs on, unobserved.
#[derive(Debug)]
pub struct ForgetNode;

impl Node for ForgetNode {
    fn names(&self) -> &'static [&'static str] {
        &["forget"]
    }

    fn apply(&self, exp: &mut FlowExpression, syscall: &mut dyn Syscall) -> Result<()> {
        let workitem = exp.applied_workitem.clone();
        if !exp.tree.children.is_empty() {
            syscall.apply_detached_child(0, workitem.clone());
        }
        syscall.reply(workitem);
        Ok(())
    }

    fn reply(
        &self,
        _exp: &mut FlowExpression,
        _from: &ChildRef,
        _workitem: Workitem,
        syscall: &mut dyn Syscall,
    ) -> Result<()> {
        syscall.wait();
        Ok(())
    }
}

/// `rewind` and `break`: leave a command in the workitem for the nearest
/// enclosing cursor and reply.
#[derive(Debug)]
pub struct CommandNode;

impl Node for CommandNode {
    fn names(&self) -> &'static [&'static str] {
        &["rewind", "break"]
    }

    fn apply(&self, exp: &mut FlowExpression, syscall: &mut dyn Syscall) -> Result<()> {
        let command = match exp.name() {
            "break" => Command::Break,
            _ => Command::Rewind,
        };
        let mut workitem = exp.applied_workitem.clone();
        workitem.set_command(command);
        syscall.reply(workitem);
        Ok(())
    }

    fn reply(
        &self,
        _exp: &mut FlowExpression,
        _from: &ChildRef,
        _workitem: Workitem,
        syscall: &mut dyn Syscall,
    ) -> Result<()> {
        syscall.wait();
        Ok(())
    }
}
