use anyhow::Result;

use crate::runtime::expression::{ChildRef, FlowExpression};
use crate::runtime::node::Node;
use crate::runtime::syscall::Syscall;
use crate::runtime::workitem::Workitem;

/// Hands the workitem to the participant named by the expression (or by
/// its `ref` attribute when spelled `participant`), then waits for it to
/// come back.
#[derive(Debug)]
pub struct ParticipantNode;

impl ParticipantNode {
    pub fn participant_name(exp: &FlowExpression) -> &str {
        match exp.tree.attr_str("ref") {
            Some(name) if exp.name() == "participant" => name,
            _ => exp.name(),
        }
    }
}

impl Node for ParticipantNode {
    fn names(&self) -> &'static [&'static str] {
        &["participant"]
    }

    fn apply(&self, exp: &mut FlowExpression, syscall: &mut dyn Syscall) -> Result<()> {
        let name = Self::participant_name(exp).to_string();
        syscall.dispatch(&name, exp.applied_workitem.clone());
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

    fn receive(
        &self,
        _exp: &mut FlowExpression,
        workitem: Workitem,
        syscall: &mut dyn Syscall,
    ) -> Result<()> {
        syscall.reply(workitem);
        Ok(())
    }

    fn cancel(&self, exp: &mut FlowExpression, syscall: &mut dyn Syscall) -> Result<()> {
        let name = Self::participant_name(exp).to_string();
        syscall.withdraw(&name);
        Ok(())
    }
}
