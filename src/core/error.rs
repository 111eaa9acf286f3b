//! 对话引擎错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 DialogError 决定 DiscardBinding / FailLeaf / Reprompt / AbortSession。
//! 只有配置错误与不变量破坏是致命的，其余都会转化为普通的节点状态。

use thiserror::Error;

/// 对话运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DialogError {
    /// 任务模板或配置不合法（加载时致命，会话不会启动）
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 取值与概念声明类型不符，绑定被丢弃
    #[error("Binding error on '{concept}': {reason}")]
    Binding { concept: String, reason: String },

    /// Execute 节点的后端调用失败
    #[error("Backend call '{call}' failed: {reason}")]
    Backend { call: String, reason: String },

    /// Request 节点等待输入超时
    #[error("Timeout waiting on agent '{agent}'")]
    Timeout { agent: String },

    /// 树结构或运行时不变量被破坏（致命，终止会话）
    #[error("Internal invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("No snapshot for turn {0}")]
    SnapshotNotFound(u64),

    /// 会话已结束或已中止，不再接受事件
    #[error("Session closed: {0}")]
    SessionClosed(String),
}

impl DialogError {
    pub fn binding(concept: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Binding {
            concept: concept.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// 是否会直接终止会话
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::InvariantViolation(_))
    }
}

/// 恢复引擎根据错误类型给出的处置动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 丢弃这次绑定，概念保持原状
    DiscardBinding,
    /// 把对应叶子节点置为 failed，由所属 Agency 的失败规则处理
    FailLeaf,
    /// 重新提示当前 Request
    Reprompt,
    /// 终止整个会话
    AbortSession,
    /// 只返回给调用方，会话状态不变
    ReportToCaller,
}
