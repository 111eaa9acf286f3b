//! 交互事件与事件队列

pub mod event;
pub mod manager;

pub use event::{BackendOutcome, InteractionEvent};
pub use manager::InteractionEventManager;
