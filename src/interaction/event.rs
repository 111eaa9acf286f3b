//! 交互事件

use serde::{Deserialize, Serialize};

use crate::concept::ProposedBinding;
use crate::dtt::NodeId;

/// 后端调用的返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendOutcome {
    Result { bindings: Vec<ProposedBinding> },
    Error { reason: String },
}

impl BackendOutcome {
    pub fn into_result(self) -> Result<Vec<ProposedBinding>, String> {
        match self {
            BackendOutcome::Result { bindings } => Ok(bindings),
            BackendOutcome::Error { reason } => Err(reason),
        }
    }
}

impl From<Result<Vec<ProposedBinding>, String>> for BackendOutcome {
    fn from(r: Result<Vec<ProposedBinding>, String>) -> Self {
        match r {
            Ok(bindings) => BackendOutcome::Result { bindings },
            Err(reason) => BackendOutcome::Error { reason },
        }
    }
}

/// 进入会话主循环的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractionEvent {
    /// 识别结果：逐槽位的假设与置信度
    UserUtterance {
        bindings: Vec<ProposedBinding>,
        /// 用户在系统输出期间插话
        #[serde(default)]
        barge_in: bool,
    },
    BackendResult {
        node: NodeId,
        call_id: u64,
        outcome: BackendOutcome,
    },
    Timeout {
        node: NodeId,
        generation: u64,
    },
    /// Inform 之后由主循环自行追加，推动对话继续
    Resume,
}

impl InteractionEvent {
    pub fn utterance(bindings: Vec<ProposedBinding>) -> Self {
        InteractionEvent::UserUtterance {
            bindings,
            barge_in: false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InteractionEvent::UserUtterance { .. } => "user_utterance",
            InteractionEvent::BackendResult { .. } => "backend_result",
            InteractionEvent::Timeout { .. } => "timeout",
            InteractionEvent::Resume => "resume",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let e: InteractionEvent = serde_json::from_str(
            r#"{"type": "user_utterance", "bindings": [{"concept": "poi", "value": "bank", "confidence": 0.9}]}"#,
        )
        .unwrap();
        assert_eq!(
            e,
            InteractionEvent::utterance(vec![ProposedBinding::new("poi", "bank", 0.9)])
        );
        let e: InteractionEvent = serde_json::from_str(
            r#"{"type": "backend_result", "node": 3, "call_id": 1, "outcome": {"error": {"reason": "down"}}}"#,
        )
        .unwrap();
        assert_eq!(e.kind(), "backend_result");
    }
}
