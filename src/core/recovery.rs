//! 错误恢复引擎
//!
//! 根据 DialogError 类型返回 RecoveryAction。
//!
//! 非致命的处置在发现错误的组件里就地完成：`ConceptStore::bind_batch` 丢弃绑定，
//! `DttManager::on_backend_result` 让 Execute 失败，`DttManager::on_timeout` 按策略重新提示或失败。
//! 对这些错误引擎只负责给出标签，DMCore 循环据此记录日志；只有 AbortSession 会改变控制流。

use crate::core::{DialogError, RecoveryAction};
use crate::dtt::TimeoutPolicy;

/// 语义化错误处置：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回默认处置动作
    pub fn handle(&self, err: &DialogError) -> RecoveryAction {
        match err {
            DialogError::Binding { .. } => RecoveryAction::DiscardBinding,
            DialogError::Backend { .. } => RecoveryAction::FailLeaf,
            DialogError::Timeout { .. } => RecoveryAction::Reprompt,
            DialogError::Configuration(_) | DialogError::InvariantViolation(_) => {
                RecoveryAction::AbortSession
            }
            DialogError::SessionNotFound(_)
            | DialogError::TemplateNotFound(_)
            | DialogError::SnapshotNotFound(_)
            | DialogError::SessionClosed(_) => RecoveryAction::ReportToCaller,
        }
    }

    /// 超时按节点声明的策略处置（Request 可配置为直接失败）
    pub fn handle_timeout(&self, err: &DialogError, policy: TimeoutPolicy) -> RecoveryAction {
        match (err, policy) {
            (DialogError::Timeout { .. }, TimeoutPolicy::Fail) => RecoveryAction::FailLeaf,
            _ => self.handle(err),
        }
    }
}
