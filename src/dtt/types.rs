//! Dialog Task Tree 类型定义
//!
//! 定义节点 ID、节点状态、五种 agent 变体及注入的 grounding 角色

use std::fmt;

use serde::{Deserialize, Serialize};

/// arena 中节点的稳定下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 节点运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// 尚未执行
    Inactive,
    /// 执行中
    Active,
    /// 成功完成
    Completed,
    /// 失败
    Failed,
    /// 被上层终止
    Aborted,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Aborted
        )
    }
}

/// Request 超时后的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// 重新提示（计入尝试次数）
    #[default]
    Reprompt,
    /// 直接失败
    Fail,
}

fn default_true() -> bool {
    true
}

/// agent 变体：统一的状态/前置条件/完成契约，执行行为按变体分派
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentKind {
    /// 组合节点，按声明顺序组织子 agent
    Agency,
    /// 请求用户绑定一个概念
    Request {
        concept: String,
        prompt: String,
        #[serde(default)]
        fillers: Vec<String>,
        /// 覆盖配置中的 request_timeout_secs，0 表示不计时
        #[serde(default)]
        timeout_secs: Option<u64>,
        /// 覆盖配置中的 max_attempts
        #[serde(default)]
        max_attempts: Option<u32>,
        #[serde(default)]
        on_timeout: TimeoutPolicy,
    },
    /// 一次性输出，派发后立即完成
    Inform {
        prompt: String,
        #[serde(default)]
        fillers: Vec<String>,
        /// false 时执行期间不能被焦点重定向抢占
        #[serde(default = "default_true")]
        interruptable: bool,
    },
    /// 调用外部后端，等待结果绑定 output 概念
    Execute {
        call: String,
        #[serde(default)]
        inputs: Vec<String>,
        output: String,
    },
    /// 被动等待概念被绑定，不输出提示
    Expect { concept: String },
}

impl AgentKind {
    pub fn is_agency(&self) -> bool {
        matches!(self, AgentKind::Agency)
    }

    /// Request 与 Inform 会产生面向用户的输出
    pub fn is_user_facing(&self) -> bool {
        matches!(self, AgentKind::Request { .. } | AgentKind::Inform { .. })
    }

    /// 该叶子关注的概念（Request/Expect 的目标，Execute 的输出）
    pub fn concept(&self) -> Option<&str> {
        match self {
            AgentKind::Request { concept, .. } | AgentKind::Expect { concept } => Some(concept),
            AgentKind::Execute { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AgentKind::Agency => "agency",
            AgentKind::Request { .. } => "request",
            AgentKind::Inform { .. } => "inform",
            AgentKind::Execute { .. } => "execute",
            AgentKind::Expect { .. } => "expect",
        }
    }
}

/// grounding 注入节点的角色
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum GroundingRole {
    /// 显式确认（Request 形态，等待 confirm 概念）
    ExplicitConfirm { concept: String },
    /// 隐式确认（Inform 形态，下一句用户输入未否认即提交）
    ImplicitConfirm { concept: String },
    /// 低置信度丢弃后的澄清提示（Inform 形态）
    Clarify { concept: String },
}

impl GroundingRole {
    pub fn concept(&self) -> &str {
        match self {
            GroundingRole::ExplicitConfirm { concept }
            | GroundingRole::ImplicitConfirm { concept }
            | GroundingRole::Clarify { concept } => concept,
        }
    }
}

/// 保留的确认概念名（bool，系统作用域）
pub const CONFIRM_CONCEPT: &str = "confirm";

/// 系统作用域路径
pub const SYSTEM_SCOPE: &str = "/";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!AgentStatus::Inactive.is_terminal());
        assert!(!AgentStatus::Active.is_terminal());
        assert!(AgentStatus::Completed.is_terminal());
        assert!(AgentStatus::Failed.is_terminal());
        assert!(AgentStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_kind_deserialize_defaults() {
        let kind: AgentKind =
            serde_json::from_str(r#"{"kind": "inform", "prompt": "show_results"}"#).unwrap();
        assert_eq!(
            kind,
            AgentKind::Inform {
                prompt: "show_results".to_string(),
                fillers: vec![],
                interruptable: true,
            }
        );
        let kind: AgentKind = serde_json::from_str(
            r#"{"kind": "request", "concept": "poi", "prompt": "ask_poi", "on_timeout": "fail"}"#,
        )
        .unwrap();
        assert!(matches!(
            kind,
            AgentKind::Request { on_timeout: TimeoutPolicy::Fail, .. }
        ));
    }
}
