//! 节点谓词
//!
//! 模板中的 `Predicate` 用名字引用概念与 agent；实例化时编译为 `Condition`，
//! agent 引用解析为 NodeId，求值时不再查找路径。

use serde::{Deserialize, Serialize};

use super::types::{AgentStatus, NodeId};
use crate::concept::ConceptValue;
use crate::core::DialogError;

/// 模板里声明的布尔表达式（概念谓词 + 子 agent 状态）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Always,
    Never,
    /// 概念有可用值（不含等待显式确认的值）
    Available { concept: String },
    /// 概念在本轮事件中被绑定且未被拒绝
    Updated { concept: String },
    Grounded { concept: String },
    Equals { concept: String, value: ConceptValue },
    Completed { agent: String },
    Failed { agent: String },
    Not { of: Box<Predicate> },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
}

impl Predicate {
    pub fn available(concept: impl Into<String>) -> Self {
        Predicate::Available {
            concept: concept.into(),
        }
    }

    pub fn updated(concept: impl Into<String>) -> Self {
        Predicate::Updated {
            concept: concept.into(),
        }
    }

    pub fn grounded(concept: impl Into<String>) -> Self {
        Predicate::Grounded {
            concept: concept.into(),
        }
    }

    pub fn equals(concept: impl Into<String>, value: impl Into<ConceptValue>) -> Self {
        Predicate::Equals {
            concept: concept.into(),
            value: value.into(),
        }
    }

    pub fn completed(agent: impl Into<String>) -> Self {
        Predicate::Completed {
            agent: agent.into(),
        }
    }

    pub fn failed(agent: impl Into<String>) -> Self {
        Predicate::Failed {
            agent: agent.into(),
        }
    }

    pub fn not(p: Predicate) -> Self {
        Predicate::Not { of: Box::new(p) }
    }

    pub fn all(of: Vec<Predicate>) -> Self {
        Predicate::All { of }
    }

    pub fn any(of: Vec<Predicate>) -> Self {
        Predicate::Any { of }
    }
}

/// 谓词求值所需的只读视图
pub trait ConditionScope {
    fn status(&self, id: NodeId) -> AgentStatus;
    fn concept_settled(&self, name: &str) -> bool;
    fn concept_grounded(&self, name: &str) -> bool;
    fn concept_updated(&self, name: &str) -> bool;
    fn concept_value(&self, name: &str) -> Option<&ConceptValue>;
}

/// 编译后的谓词
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Const(bool),
    Available(String),
    Updated(String),
    Grounded(String),
    Equals(String, ConceptValue),
    Status(NodeId, AgentStatus),
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    /// 编译：agent 名通过 resolve 解析，概念名必须已声明
    pub fn compile<R, C>(pred: &Predicate, resolve: &R, has_concept: &C) -> Result<Self, DialogError>
    where
        R: Fn(&str) -> Option<NodeId>,
        C: Fn(&str) -> bool,
    {
        let concept = |name: &str| -> Result<String, DialogError> {
            if has_concept(name) {
                Ok(name.to_string())
            } else {
                Err(DialogError::config(format!(
                    "predicate references undeclared concept '{}'",
                    name
                )))
            }
        };
        let agent = |name: &str| -> Result<NodeId, DialogError> {
            resolve(name).ok_or_else(|| {
                DialogError::config(format!("predicate references unknown agent '{}'", name))
            })
        };

        Ok(match pred {
            Predicate::Always => Condition::Const(true),
            Predicate::Never => Condition::Const(false),
            Predicate::Available { concept: c } => Condition::Available(concept(c)?),
            Predicate::Updated { concept: c } => Condition::Updated(concept(c)?),
            Predicate::Grounded { concept: c } => Condition::Grounded(concept(c)?),
            Predicate::Equals { concept: c, value } => {
                Condition::Equals(concept(c)?, value.clone())
            }
            Predicate::Completed { agent: a } => Condition::Status(agent(a)?, AgentStatus::Completed),
            Predicate::Failed { agent: a } => Condition::Status(agent(a)?, AgentStatus::Failed),
            Predicate::Not { of } => {
                Condition::Not(Box::new(Condition::compile(of, resolve, has_concept)?))
            }
            Predicate::All { of } => Condition::All(
                of.iter()
                    .map(|p| Condition::compile(p, resolve, has_concept))
                    .collect::<Result<_, _>>()?,
            ),
            Predicate::Any { of } => Condition::Any(
                of.iter()
                    .map(|p| Condition::compile(p, resolve, has_concept))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    pub fn eval(&self, scope: &dyn ConditionScope) -> bool {
        match self {
            Condition::Const(b) => *b,
            Condition::Available(c) => scope.concept_settled(c),
            Condition::Updated(c) => scope.concept_updated(c),
            Condition::Grounded(c) => scope.concept_grounded(c),
            Condition::Equals(c, v) => {
                scope.concept_settled(c) && scope.concept_value(c) == Some(v)
            }
            Condition::Status(id, status) => scope.status(*id) == *status,
            Condition::Not(inner) => !inner.eval(scope),
            Condition::All(items) => items.iter().all(|c| c.eval(scope)),
            Condition::Any(items) => items.iter().any(|c| c.eval(scope)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeScope {
        statuses: HashMap<NodeId, AgentStatus>,
        settled: HashMap<String, ConceptValue>,
        updated: Vec<String>,
    }

    impl ConditionScope for FakeScope {
        fn status(&self, id: NodeId) -> AgentStatus {
            self.statuses
                .get(&id)
                .copied()
                .unwrap_or(AgentStatus::Inactive)
        }
        fn concept_settled(&self, name: &str) -> bool {
            self.settled.contains_key(name)
        }
        fn concept_grounded(&self, name: &str) -> bool {
            self.settled.contains_key(name)
        }
        fn concept_updated(&self, name: &str) -> bool {
            self.updated.iter().any(|u| u == name)
        }
        fn concept_value(&self, name: &str) -> Option<&ConceptValue> {
            self.settled.get(name)
        }
    }

    fn compile(p: &Predicate) -> Result<Condition, DialogError> {
        let resolve = |name: &str| (name == "SearchPoi").then_some(NodeId(2));
        let has = |name: &str| matches!(name, "poi" | "destination" | "help");
        Condition::compile(p, &resolve, &has)
    }

    #[test]
    fn test_compile_rejects_unknown_refs() {
        assert!(matches!(
            compile(&Predicate::available("nope")),
            Err(DialogError::Configuration(_))
        ));
        assert!(matches!(
            compile(&Predicate::completed("Nowhere")),
            Err(DialogError::Configuration(_))
        ));
    }

    #[test]
    fn test_eval_composite() {
        let p = Predicate::all(vec![
            Predicate::completed("SearchPoi"),
            Predicate::not(Predicate::updated("help")),
            Predicate::equals("poi", "bank"),
        ]);
        let cond = compile(&p).unwrap();

        let mut scope = FakeScope::default();
        assert!(!cond.eval(&scope));
        scope.statuses.insert(NodeId(2), AgentStatus::Completed);
        scope.settled.insert("poi".into(), "bank".into());
        assert!(cond.eval(&scope));
        scope.updated.push("help".into());
        assert!(!cond.eval(&scope));
    }

    #[test]
    fn test_predicate_serde_shape() {
        let p: Predicate = serde_json::from_str(
            r#"{"op": "any", "of": [{"op": "available", "concept": "destination"}, {"op": "never"}]}"#,
        )
        .unwrap();
        assert_eq!(
            p,
            Predicate::any(vec![Predicate::available("destination"), Predicate::Never])
        );
    }
}
