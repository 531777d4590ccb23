pub mod common;
pub mod flow;
pub mod participant;
pub mod subprocess;

use std::sync::Arc;

use crate::runtime::node::Node;

/// Every expression kind the engine knows out of the box. Participant
/// expressions are resolved separately, by participant name.
pub fn standard_nodes() -> Vec<Arc<dyn Node>> {
    vec![
        Arc::new(common::PassNode),
        Arc::new(common::LoseNode),
        Arc::new(common::ForgetNode),
        Arc::new(common::CommandNode),
        Arc::new(flow::SequenceNode),
        Arc::new(flow::CursorNode),
        Arc::new(flow::ConcurrenceNode),
        Arc::new(subprocess::SubprocessNode),
        Arc::new(participant::ParticipantNode),
    ]
}
