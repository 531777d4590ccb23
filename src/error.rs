use thiserror::Error;

/// Typed failures of the execution core. Engine and storage seams return
/// `anyhow::Result` and wrap these; `downcast_ref::<FlowError>()` recovers
/// them.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlowError {
    #[error("string '{0}' can't be turned back into a flow expression id")]
    Format(String),

    #[error("apply failed at {fei}: {message}")]
    Apply { fei: String, message: String },

    #[error("dispatch to participant '{participant}' failed for {fei}: {message}")]
    Dispatch {
        fei: String,
        participant: String,
        message: String,
    },

    #[error("expression {parent} references child {child} with no stored state")]
    ReplayInconsistency { parent: String, child: String },

    #[error("no expression or participant named '{0}'")]
    UnknownExpression(String),

    #[error("no participant registered under '{0}'")]
    UnknownParticipant(String),

    #[error("storage error: {0}")]
    Storage(String),
}
