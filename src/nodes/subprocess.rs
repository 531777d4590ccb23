use anyhow::{Result, anyhow};

use crate::dsl::Tree;
use crate::runtime::expression::{ChildRef, FlowExpression};
use crate::runtime::node::Node;
use crate::runtime::syscall::Syscall;
use crate::runtime::workitem::Workitem;

/// Runs a definition registered on the engine as a sub-process: its root
/// gets wfid `"<wfid>_<n>"` and replies here when done.
#[derive(Debug)]
pub struct SubprocessNode;

impl Node for SubprocessNode {
    fn names(&self) -> &'static [&'static str] {
        &["subprocess"]
    }

    fn validate(&self, tree: &Tree) -> Result<()> {
        tree.attr_str("ref")
            .map(|_| ())
            .ok_or_else(|| anyhow!("subprocess requires a 'ref' attribute"))
    }

    fn apply(&self, exp: &mut FlowExpression, syscall: &mut dyn Syscall) -> Result<()> {
        let definition = exp
            .tree
            .attr_str("ref")
            .ok_or_else(|| anyhow!("subprocess requires a 'ref' attribute"))?
            .to_string();
        syscall.apply_subprocess(&definition, exp.applied_workitem.clone());
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
