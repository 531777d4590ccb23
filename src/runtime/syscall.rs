use crate::runtime::fei::FlowExpressionId;
use crate::runtime::workitem::Workitem;

/// Effects a node behaviour asks the engine to carry out once its
/// transition returns. Nothing is sent while the behaviour runs.
pub trait Syscall: Send {
    /// Creates a child from the declared child tree at `position` and
    /// applies it. The child's identity is allocated by the engine.
    fn apply_child(&mut self, position: usize, workitem: Workitem);

    /// Like `apply_child`, but the child starts detached: it never replies
    /// to this expression.
    fn apply_detached_child(&mut self, position: usize, workitem: Workitem);

    /// Applies a sub-process root running `definition`.
    fn apply_subprocess(&mut self, definition: &str, workitem: Workitem);

    /// Reports upward and ends this expression.
    fn reply(&mut self, workitem: Workitem);

    /// Reports a failure upward and ends this expression.
    fn fail(&mut self, message: String);

    /// Cancels a live child; its eventual reply is discarded.
    fn cancel_child(&mut self, child: &FlowExpressionId);

    /// Hands the workitem to an external participant.
    fn dispatch(&mut self, participant: &str, workitem: Workitem);

    /// Tells the participant holding this expression's workitem to drop it.
    fn withdraw(&mut self, participant: &str);

    /// Stays put, waiting on children or a participant.
    fn wait(&mut self);
}
