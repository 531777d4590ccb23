pub mod config;
pub mod dsl;
pub mod error;
pub mod nodes;
pub mod participants;
pub mod runtime;

pub use config::EngineConfig;
pub use dsl::Tree;
pub use error::FlowError;
pub use runtime::engine::Engine;
pub use runtime::fei::FlowExpressionId;
pub use runtime::workitem::Workitem;
