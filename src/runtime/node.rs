use anyhow::Result;
use std::fmt::Debug;

use crate::dsl::Tree;
use crate::runtime::expression::{ChildRef, FlowExpression};
use crate::runtime::syscall::Syscall;
use crate::runtime::workitem::Workitem;

/// Behaviour of one kind of expression.
///
/// Implementations are stateless: everything that must survive a restart
/// lives in the `FlowExpression` handed to each call. The engine looks a
/// behaviour up by the expression's tree name.
pub trait Node: Send + Sync + Debug {
    /// Names this behaviour answers to in a process definition.
    fn names(&self) -> &'static [&'static str];

    /// Checked before apply; an error becomes an apply failure.
    fn validate(&self, _tree: &Tree) -> Result<()> {
        Ok(())
    }

    fn apply(&self, exp: &mut FlowExpression, syscall: &mut dyn Syscall) -> Result<()>;

    /// A child replied. The engine has already removed `from` from
    /// `exp.children`.
    fn reply(
        &self,
        exp: &mut FlowExpression,
        from: &ChildRef,
        workitem: Workitem,
        syscall: &mut dyn Syscall,
    ) -> Result<()>;

    /// A participant handed the workitem back. Only participant
    /// expressions expect this.
    fn receive(
        &self,
        _exp: &mut FlowExpression,
        _workitem: Workitem,
        syscall: &mut dyn Syscall,
    ) -> Result<()> {
        syscall.wait();
        Ok(())
    }

    /// True for behaviours that never report to their parent.
    fn loses(&self) -> bool {
        false
    }

    /// Cancels every live child. The engine ends the expression afterwards.
    fn cancel(&self, exp: &mut FlowExpression, syscall: &mut dyn Syscall) -> Result<()> {
        for child in &exp.children {
            syscall.cancel_child(&child.fei);
        }
        Ok(())
    }

    /// A child failed: abandon the siblings and pass the failure on.
    fn child_failed(
        &self,
        exp: &mut FlowExpression,
        _from: &ChildRef,
        message: String,
        syscall: &mut dyn Syscall,
    ) -> Result<()> {
        for child in &exp.children {
            syscall.cancel_child(&child.fei);
        }
        syscall.fail(message);
        Ok(())
    }
}
