//! 核心编排层：错误与恢复、状态快照、会话监管、任务调度、DMCore 主控循环

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use error::{DialogError, RecoveryAction};
pub use orchestrator::{
    DialogSession, DispatchedCall, RestoreReport, SessionStatus, TimerCommand, TurnReport,
};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use state::{DialogState, StateManager};
pub use task_scheduler::TaskScheduler;
