pub mod fei;
pub mod workitem;
pub mod expression;
pub mod message;
pub mod node;
pub mod syscall;
pub mod storage;
pub mod redis_storage;
pub mod history;
pub mod engine;
