//! 概念存储：带置信度与可用状态的类型化槽位
//!
//! 状态只允许 unavailable -> available/updated -> grounded 方向推进，
//! 或通过显式 clear 回到 unavailable；低置信度的待定绑定可以 discard 回到绑定前的原样。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::value::{ConceptType, ConceptValue};
use crate::core::DialogError;

/// 概念可用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptState {
    /// 无值
    Unavailable,
    /// 由可信的内部来源设定（脚本、恢复、默认值），无需 grounding
    Available,
    /// 本轮事件刚绑定，等待 grounding 决策
    Updated,
    /// 已接受或已确认
    Grounded,
}

/// 绑定来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingSource {
    User,
    Backend,
    Script,
    Restore,
}

/// 历史中的一次绑定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub value: ConceptValue,
    pub confidence: f32,
    pub source: BindingSource,
    pub turn: u64,
    /// 该绑定是否已被确认
    pub grounded: bool,
}

/// 绑定前的状态，用于 discard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Prior {
    value: Option<ConceptValue>,
    confidence: f32,
    state: ConceptState,
}

/// 单个概念
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    /// 声明该概念的 agent 路径
    pub scope: String,
    pub ty: ConceptType,
    value: Option<ConceptValue>,
    confidence: f32,
    state: ConceptState,
    history: Vec<Binding>,
    prior: Option<Prior>,
}

impl Concept {
    fn new(scope: &str, name: &str, ty: ConceptType) -> Self {
        Self {
            name: name.to_string(),
            scope: scope.to_string(),
            ty,
            value: None,
            confidence: 0.0,
            state: ConceptState::Unavailable,
            history: Vec::new(),
            prior: None,
        }
    }

    pub fn value(&self) -> Option<&ConceptValue> {
        self.value.as_ref()
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn state(&self) -> ConceptState {
        self.state
    }

    pub fn history(&self) -> &[Binding] {
        &self.history
    }

    fn checked(&self, value: ConceptValue) -> Result<ConceptValue, DialogError> {
        let kind = value.kind_name();
        value.coerce(self.ty).ok_or_else(|| {
            DialogError::binding(
                &self.name,
                format!("expected {}, got {}", self.ty, kind),
            )
        })
    }
}

/// 批量绑定的结果：成功绑定的概念名与被丢弃的错误
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub bound: Vec<String>,
    pub rejected: Vec<DialogError>,
}

/// 事件中提议的一个绑定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedBinding {
    pub concept: String,
    pub value: ConceptValue,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    1.0
}

impl ProposedBinding {
    pub fn new(concept: impl Into<String>, value: impl Into<ConceptValue>, confidence: f32) -> Self {
        Self {
            concept: concept.into(),
            value: value.into(),
            confidence,
        }
    }
}

/// 概念存储（按名字索引，BTreeMap 保证遍历顺序确定）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConceptStore {
    concepts: BTreeMap<String, Concept>,
}

impl ConceptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明概念；同名重复声明视为不变量破坏
    pub fn declare(&mut self, scope: &str, name: &str, ty: ConceptType) -> Result<(), DialogError> {
        if let Some(existing) = self.concepts.get(name) {
            return Err(DialogError::invariant(format!(
                "concept '{}' declared in both '{}' and '{}'",
                name, existing.scope, scope
            )));
        }
        self.concepts
            .insert(name.to_string(), Concept::new(scope, name, ty));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.concepts.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Concept> {
        self.concepts.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&ConceptValue> {
        self.concepts.get(name).and_then(|c| c.value.as_ref())
    }

    pub fn state(&self, name: &str) -> ConceptState {
        self.concepts
            .get(name)
            .map(|c| c.state)
            .unwrap_or(ConceptState::Unavailable)
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.state(name) != ConceptState::Unavailable
    }

    pub fn is_updated(&self, name: &str) -> bool {
        self.state(name) == ConceptState::Updated
    }

    pub fn is_grounded(&self, name: &str) -> bool {
        self.state(name) == ConceptState::Grounded
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.concepts.keys().map(|k| k.as_str())
    }

    /// 声明在 scope 前缀之下的概念（含 scope 本身）
    pub fn names_in_scope(&self, scope: &str) -> Vec<String> {
        let prefix = format!("{}/", scope.trim_end_matches('/'));
        self.concepts
            .values()
            .filter(|c| c.scope == scope || c.scope.starts_with(&prefix))
            .map(|c| c.name.clone())
            .collect()
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Concept, DialogError> {
        self.concepts
            .get_mut(name)
            .ok_or_else(|| DialogError::binding(name, "concept not declared"))
    }

    /// 绑定新值：状态变为 updated 并追加历史；类型不符时返回 BindingError，概念保持不变
    pub fn bind(
        &mut self,
        name: &str,
        value: ConceptValue,
        confidence: f32,
        source: BindingSource,
        turn: u64,
    ) -> Result<(), DialogError> {
        let concept = self.get_mut(name)?;
        let value = concept.checked(value)?;
        concept.prior = Some(Prior {
            value: concept.value.take(),
            confidence: concept.confidence,
            state: concept.state,
        });
        concept.history.push(Binding {
            value: value.clone(),
            confidence,
            source,
            turn,
            grounded: false,
        });
        concept.value = Some(value);
        concept.confidence = confidence;
        concept.state = ConceptState::Updated;
        Ok(())
    }

    /// 一个事件里的所有绑定先整体写入，再做 grounding
    ///
    /// 同一事件对同一概念的多个提议只取最后一个，prior 始终是事件之前的状态。
    pub fn bind_batch(
        &mut self,
        bindings: &[ProposedBinding],
        source: BindingSource,
        turn: u64,
    ) -> BatchOutcome {
        let last: BTreeMap<&str, usize> = bindings
            .iter()
            .enumerate()
            .map(|(i, b)| (b.concept.as_str(), i))
            .collect();
        let mut outcome = BatchOutcome::default();
        for (i, b) in bindings.iter().enumerate() {
            if last.get(b.concept.as_str()) != Some(&i) {
                debug!(concept = %b.concept, "Binding superseded within the same event");
                continue;
            }
            match self.bind(&b.concept, b.value.clone(), b.confidence, source, turn) {
                Ok(()) => {
                    if !outcome.bound.contains(&b.concept) {
                        outcome.bound.push(b.concept.clone());
                    }
                }
                Err(e) => outcome.rejected.push(e),
            }
        }
        outcome
    }

    /// 可信来源直接设值（脚本 SetConcept、模板默认值），状态为 available
    pub fn set(
        &mut self,
        name: &str,
        value: ConceptValue,
        source: BindingSource,
        turn: u64,
    ) -> Result<(), DialogError> {
        let concept = self.get_mut(name)?;
        let value = concept.checked(value)?;
        concept.prior = None;
        concept.history.push(Binding {
            value: value.clone(),
            confidence: 1.0,
            source,
            turn,
            grounded: false,
        });
        concept.value = Some(value);
        concept.confidence = 1.0;
        concept.state = ConceptState::Available;
        Ok(())
    }

    /// 显式清空，回到 unavailable（历史保留，供 RestoreConcept 使用）
    pub fn clear(&mut self, name: &str) -> Result<(), DialogError> {
        let concept = self.get_mut(name)?;
        concept.value = None;
        concept.confidence = 0.0;
        concept.state = ConceptState::Unavailable;
        concept.prior = None;
        Ok(())
    }

    /// 确认通过：updated -> grounded
    pub fn commit(&mut self, name: &str) -> Result<(), DialogError> {
        let concept = self.get_mut(name)?;
        if concept.state != ConceptState::Updated {
            return Err(DialogError::invariant(format!(
                "commit of '{}' in state {:?}",
                name, concept.state
            )));
        }
        concept.state = ConceptState::Grounded;
        concept.prior = None;
        if let Some(last) = concept.history.last_mut() {
            last.grounded = true;
        }
        Ok(())
    }

    /// 撤销最近一次待定绑定，恢复到绑定前的值与状态
    pub fn discard(&mut self, name: &str) -> Result<(), DialogError> {
        let concept = self.get_mut(name)?;
        if concept.state != ConceptState::Updated {
            return Err(DialogError::invariant(format!(
                "discard of '{}' in state {:?}",
                name, concept.state
            )));
        }
        let prior = concept.prior.take().unwrap_or(Prior {
            value: None,
            confidence: 0.0,
            state: ConceptState::Unavailable,
        });
        concept.history.pop();
        concept.value = prior.value;
        concept.confidence = prior.confidence;
        concept.state = prior.state;
        Ok(())
    }

    /// 从概念自身历史中恢复上一次绑定；返回是否恢复成功
    pub fn restore_previous(&mut self, name: &str, turn: u64) -> Result<bool, DialogError> {
        let concept = self.get_mut(name)?;
        // 已清空时恢复最后一次绑定，否则恢复当前值之前的那次
        let skip = if concept.state == ConceptState::Unavailable { 0 } else { 1 };
        let Some(binding) = concept.history.iter().rev().nth(skip).cloned() else {
            return Ok(false);
        };
        concept.history.push(Binding {
            source: BindingSource::Restore,
            turn,
            ..binding.clone()
        });
        concept.value = Some(binding.value);
        concept.confidence = binding.confidence;
        concept.state = if binding.grounded {
            ConceptState::Grounded
        } else {
            ConceptState::Available
        };
        concept.prior = None;
        Ok(true)
    }

    /// 用快照中的概念整体替换（StateManager::restore_concept）
    pub fn replace(&mut self, concept: Concept) -> Result<(), DialogError> {
        let current = self.get_mut(&concept.name)?;
        if current.ty != concept.ty {
            return Err(DialogError::invariant(format!(
                "restored concept '{}' changed type",
                concept.name
            )));
        }
        *current = concept;
        Ok(())
    }

    /// 当前处于 updated 的概念
    pub fn updated_names(&self) -> BTreeSet<String> {
        self.concepts
            .values()
            .filter(|c| c.state == ConceptState::Updated)
            .map(|c| c.name.clone())
            .collect()
    }
}
