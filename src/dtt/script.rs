//! 完成脚本：节点进入终止状态时由调度器解释执行的固定动作列表

use serde::{Deserialize, Serialize};

use super::types::NodeId;
use crate::concept::ConceptValue;

/// RestoreConcept 的取值来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    /// 概念自身历史中的上一次绑定
    #[default]
    PreviousBinding,
    /// N 轮之前的快照
    TurnsAgo(u64),
}

/// SetConcept 的取值来源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Literal(ConceptValue),
    /// 复制另一个概念的当前值
    Concept(String),
    /// 从帧数组概念中按 1 起的序号概念选取元素
    Select { array: String, index: String },
}

/// 模板中声明的脚本动作（agent 以名字引用，缺省指脚本所属节点）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScriptAction {
    Clear {
        concepts: Vec<String>,
    },
    RestoreConcept {
        concept: String,
        #[serde(default)]
        from: RestoreSource,
    },
    Reset {
        #[serde(default)]
        agent: Option<String>,
    },
    Reopen {
        #[serde(default)]
        agent: Option<String>,
    },
    ContinueWith {
        target: String,
    },
    SetConcept {
        concept: String,
        value: ValueSource,
    },
}

impl ScriptAction {
    pub fn clear<I, S>(concepts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptAction::Clear {
            concepts: concepts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn reopen_self() -> Self {
        ScriptAction::Reopen { agent: None }
    }

    pub fn reset_self() -> Self {
        ScriptAction::Reset { agent: None }
    }

    pub fn continue_with(target: impl Into<String>) -> Self {
        ScriptAction::ContinueWith {
            target: target.into(),
        }
    }

    pub fn select(
        concept: impl Into<String>,
        array: impl Into<String>,
        index: impl Into<String>,
    ) -> Self {
        ScriptAction::SetConcept {
            concept: concept.into(),
            value: ValueSource::Select {
                array: array.into(),
                index: index.into(),
            },
        }
    }
}

/// 编译后的脚本动作（agent 引用已解析）
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionAction {
    Clear(Vec<String>),
    RestoreConcept { concept: String, from: RestoreSource },
    Reset(NodeId),
    Reopen(NodeId),
    ContinueWith(NodeId),
    SetConcept { concept: String, value: ValueSource },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_serde_shape() {
        let json = r#"[
            {"action": "reopen"},
            {"action": "clear", "concepts": ["poi", "results", "destination"]},
            {"action": "continue_with", "target": "/Main"},
            {"action": "restore_concept", "concept": "results", "from": {"turns_ago": 2}},
            {"action": "set_concept", "concept": "destination",
             "value": {"select": {"array": "results", "index": "choice"}}}
        ]"#;
        let actions: Vec<ScriptAction> = serde_json::from_str(json).unwrap();
        assert_eq!(actions[0], ScriptAction::reopen_self());
        assert_eq!(
            actions[1],
            ScriptAction::clear(["poi", "results", "destination"])
        );
        assert_eq!(
            actions[3],
            ScriptAction::RestoreConcept {
                concept: "results".into(),
                from: RestoreSource::TurnsAgo(2),
            }
        );
        assert_eq!(actions[4], ScriptAction::select("destination", "results", "choice"));
    }
}
