//! GroundingManager
//!
//! 对一个事件批量绑定的每个概念做一次分档决策，并跟踪尚未结束的确认：
//! - 显式确认：概念保持 updated，直到用户回答 confirm=true/false 或重新绑定该概念
//! - 隐式确认：概念立即可用，下一句用户输入未否认即提交
//! 另外维护期望集合（当前活跃的 Request/Expect 关注的概念）。

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::policy::{
    ConfirmationMode, GroundingAction, GroundingOverride, GroundingPolicy, ThresholdPolicy,
    Thresholds,
};
use crate::concept::{ConceptState, ConceptStore, ConceptType, ProposedBinding};
use crate::core::DialogError;
use crate::dtt::{AgentTemplate, NodeId, TaskTemplate, CONFIRM_CONCEPT};

/// 一条等待中的确认
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub concept: String,
    pub mode: ConfirmationMode,
    /// 绑定时期望该概念的 Request（否认后需要 REOPEN）
    pub elicitor: Option<NodeId>,
    /// 为此注入的确认节点
    pub node: Option<NodeId>,
}

/// 可快照的 grounding 运行时状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundingState {
    explicit: Vec<PendingConfirmation>,
    implicit: Vec<PendingConfirmation>,
    expectations: BTreeMap<String, NodeId>,
}

/// 事件绑定前对未决确认的结算结果
#[derive(Debug, Default, PartialEq)]
pub struct Settlement {
    /// 已提交为 grounded 的概念
    pub committed: Vec<String>,
    /// 被否认或被新值取代而撤销的概念
    pub discarded: Vec<String>,
    /// 需要 REOPEN 的原请求节点
    pub reopen: Vec<NodeId>,
    /// 已得到回答、应当结束的确认节点
    pub resolved_nodes: Vec<NodeId>,
    /// 本事件剩余待绑定的内容（confirm 回答已被消费）
    pub remaining: Vec<ProposedBinding>,
    /// strict 模式下被丢弃的非期望绑定
    pub unexpected: Vec<String>,
}

/// 一批绑定的 grounding 决策
#[derive(Debug, Default, PartialEq)]
pub struct GroundingReport {
    pub accepted: Vec<String>,
    /// 需要注入确认节点的概念
    pub confirm: Vec<(String, ConfirmationMode)>,
    /// 低置信度被撤销、需要澄清的概念
    pub rejected: Vec<String>,
}

impl GroundingReport {
    /// 通过 grounding 的概念（接受或待确认）
    pub fn surviving(&self) -> impl Iterator<Item = &str> {
        self.accepted
            .iter()
            .map(String::as_str)
            .chain(self.confirm.iter().map(|(c, _)| c.as_str()))
    }
}

/// 分档决策与确认跟踪
#[derive(Debug)]
pub struct GroundingManager {
    default_policy: Box<dyn GroundingPolicy>,
    type_policies: HashMap<ConceptType, Box<dyn GroundingPolicy>>,
    concept_policies: HashMap<String, Box<dyn GroundingPolicy>>,
    strict_expectations: bool,
    max_confirm_attempts: u32,
    state: GroundingState,
}

impl GroundingManager {
    pub fn new(thresholds: Thresholds) -> Result<Self, DialogError> {
        let policy = ThresholdPolicy::new(thresholds).map_err(DialogError::config)?;
        Ok(Self {
            default_policy: Box::new(policy),
            type_policies: HashMap::new(),
            concept_policies: HashMap::new(),
            strict_expectations: false,
            max_confirm_attempts: 2,
            state: GroundingState::default(),
        })
    }

    /// 按配置与模板中的概念覆盖构建
    pub fn from_config(
        config: &crate::config::GroundingConfig,
        template: &TaskTemplate,
    ) -> Result<Self, DialogError> {
        let base = config.thresholds();
        let mut manager = Self::new(base)?;
        manager.strict_expectations = config.strict_expectations;
        manager.max_confirm_attempts = config.max_confirm_attempts.max(1);

        let types = config.type_overrides()?;
        for (ty, overrides) in &types {
            let policy = ThresholdPolicy::new(overrides.apply(base))
                .map_err(|e| DialogError::config(format!("grounding.types.{}: {}", ty, e)))?;
            manager.type_policies.insert(*ty, Box::new(policy));
        }

        fn walk(
            agent: &AgentTemplate,
            base: Thresholds,
            types: &HashMap<ConceptType, GroundingOverride>,
            out: &mut HashMap<String, Box<dyn GroundingPolicy>>,
        ) -> Result<(), DialogError> {
            for decl in &agent.concepts {
                if let Some(o) = &decl.grounding {
                    let typed = types.get(&decl.ty).map(|t| t.apply(base)).unwrap_or(base);
                    let policy = ThresholdPolicy::new(o.apply(typed)).map_err(|e| {
                        DialogError::config(format!("grounding of concept '{}': {}", decl.name, e))
                    })?;
                    out.insert(decl.name.clone(), Box::new(policy));
                }
            }
            for child in &agent.children {
                walk(child, base, types, out)?;
            }
            Ok(())
        }
        walk(&template.root, base, &types, &mut manager.concept_policies)?;
        Ok(manager)
    }

    pub fn with_strict_expectations(mut self, strict: bool) -> Self {
        self.strict_expectations = strict;
        self
    }

    /// 注册某个概念类型的策略
    pub fn with_type_policy(mut self, ty: ConceptType, policy: Box<dyn GroundingPolicy>) -> Self {
        self.type_policies.insert(ty, policy);
        self
    }

    /// 注册单个概念的策略（优先于类型策略）
    pub fn with_concept_policy(
        mut self,
        concept: impl Into<String>,
        policy: Box<dyn GroundingPolicy>,
    ) -> Self {
        self.concept_policies.insert(concept.into(), policy);
        self
    }

    pub fn max_confirm_attempts(&self) -> u32 {
        self.max_confirm_attempts
    }

    /// 单个概念、单个置信度的分档动作；策略按 概念 > 类型 > 默认 选择
    pub fn classify(&self, store: &ConceptStore, concept: &str, confidence: f32) -> GroundingAction {
        if let Some(p) = self.concept_policies.get(concept) {
            return p.classify(confidence);
        }
        if let Some(p) = store
            .get(concept)
            .and_then(|c| self.type_policies.get(&c.ty))
        {
            return p.classify(confidence);
        }
        self.default_policy.classify(confidence)
    }

    /// 概念是否可以被当作已有值使用：available / grounded，或正在隐式确认中
    pub fn settled(&self, store: &ConceptStore, name: &str) -> bool {
        match store.state(name) {
            ConceptState::Available | ConceptState::Grounded => true,
            ConceptState::Updated => self.state.implicit.iter().any(|p| p.concept == name),
            ConceptState::Unavailable => false,
        }
    }

    pub fn set_expectations(&mut self, expectations: BTreeMap<String, NodeId>) {
        self.state.expectations = expectations;
    }

    pub fn expectations(&self) -> &BTreeMap<String, NodeId> {
        &self.state.expectations
    }

    pub fn is_expected(&self, concept: &str) -> bool {
        self.state.expectations.contains_key(concept)
    }

    pub fn pending_explicit(&self) -> &[PendingConfirmation] {
        &self.state.explicit
    }

    pub fn pending_implicit(&self) -> &[PendingConfirmation] {
        &self.state.implicit
    }

    /// 记录为某个待确认概念注入的节点
    pub fn attach_node(&mut self, concept: &str, node: NodeId) {
        if let Some(p) = self
            .state
            .explicit
            .iter_mut()
            .chain(self.state.implicit.iter_mut())
            .find(|p| p.concept == concept && p.node.is_none())
        {
            p.node = Some(node);
        }
    }

    /// 用户输入到达、绑定之前：结算上一轮留下的确认
    pub fn settle(
        &mut self,
        store: &mut ConceptStore,
        proposed: Vec<ProposedBinding>,
    ) -> Result<Settlement, DialogError> {
        let mut out = Settlement::default();
        let mut answer: Option<bool> = None;
        let mut rest = Vec::with_capacity(proposed.len());
        for b in proposed {
            if b.concept == CONFIRM_CONCEPT {
                match b.value.as_bool() {
                    Some(v) => answer = Some(v),
                    None => warn!(value = %b.value, "Ignoring non-boolean confirmation answer"),
                }
            } else {
                rest.push(b);
            }
        }
        let rebinds = |name: &str| rest.iter().any(|b| b.concept == name);

        // 隐式确认：否认或重新绑定则撤销，否则提交
        for pending in std::mem::take(&mut self.state.implicit) {
            if !store.is_updated(&pending.concept) {
                continue;
            }
            if answer == Some(false) || rebinds(&pending.concept) {
                store.discard(&pending.concept)?;
                info!(concept = %pending.concept, "Implicit confirmation denied");
                out.discarded.push(pending.concept.clone());
                out.reopen.extend(pending.elicitor);
            } else {
                store.commit(&pending.concept)?;
                debug!(concept = %pending.concept, "Implicit confirmation committed");
                out.committed.push(pending.concept.clone());
            }
        }

        // 显式确认：被新值取代的先撤销；回答作用于队首
        let mut kept = Vec::new();
        for pending in std::mem::take(&mut self.state.explicit) {
            if store.is_updated(&pending.concept) && rebinds(&pending.concept) {
                store.discard(&pending.concept)?;
                info!(concept = %pending.concept, "Pending confirmation superseded by new binding");
                out.discarded.push(pending.concept.clone());
                out.resolved_nodes.extend(pending.node);
            } else {
                kept.push(pending);
            }
        }
        if let (Some(yes), Some(head)) = (answer, kept.first().cloned()) {
            if head.node.is_some() {
                kept.remove(0);
                out.resolved_nodes.extend(head.node);
                if store.is_updated(&head.concept) {
                    if yes {
                        store.commit(&head.concept)?;
                        info!(concept = %head.concept, "Explicit confirmation accepted");
                        out.committed.push(head.concept);
                    } else {
                        store.discard(&head.concept)?;
                        info!(concept = %head.concept, "Explicit confirmation rejected");
                        out.discarded.push(head.concept);
                        out.reopen.extend(head.elicitor);
                    }
                }
            }
        }
        self.state.explicit = kept;

        if self.strict_expectations {
            let (expected, unexpected): (Vec<_>, Vec<_>) = rest
                .into_iter()
                .partition(|b| self.state.expectations.contains_key(&b.concept));
            for b in unexpected {
                warn!(concept = %b.concept, "Discarding binding for unexpected concept");
                out.unexpected.push(b.concept);
            }
            out.remaining = expected;
        } else {
            out.remaining = rest;
        }
        Ok(out)
    }

    /// 对本批已写入 store 的绑定逐一分档
    pub fn ground(
        &mut self,
        store: &mut ConceptStore,
        bound: &[String],
    ) -> Result<GroundingReport, DialogError> {
        let mut report = GroundingReport::default();
        for name in bound {
            if !store.is_updated(name) {
                continue;
            }
            let confidence = store.get(name).map(|c| c.confidence()).unwrap_or(0.0);
            let action = self.classify(store, name, confidence);
            debug!(concept = %name, confidence, ?action, "Grounding decision");
            match action {
                GroundingAction::Accept => {
                    store.commit(name)?;
                    report.accepted.push(name.clone());
                }
                GroundingAction::Confirm(mode) => {
                    let pending = PendingConfirmation {
                        concept: name.clone(),
                        mode,
                        elicitor: self.state.expectations.get(name).copied(),
                        node: None,
                    };
                    match mode {
                        ConfirmationMode::Explicit => self.state.explicit.push(pending),
                        ConfirmationMode::Implicit => self.state.implicit.push(pending),
                    }
                    report.confirm.push((name.clone(), mode));
                }
                GroundingAction::Reject => {
                    store.discard(name)?;
                    report.rejected.push(name.clone());
                }
            }
        }
        Ok(report)
    }

    /// 确认节点失败（超过尝试次数）：撤销待确认的绑定，返回需要 REOPEN 的原请求
    pub fn abandon(
        &mut self,
        store: &mut ConceptStore,
        concept: &str,
    ) -> Result<Option<NodeId>, DialogError> {
        let Some(idx) = self.state.explicit.iter().position(|p| p.concept == concept) else {
            return Ok(None);
        };
        let pending = self.state.explicit.remove(idx);
        if store.is_updated(concept) {
            store.discard(concept)?;
        }
        warn!(concept, "Confirmation abandoned, binding discarded");
        Ok(pending.elicitor)
    }

    /// 概念被脚本清空或恢复时，相关的待确认项一并作废
    pub fn forget(&mut self, concept: &str) {
        self.state.explicit.retain(|p| p.concept != concept);
        self.state.implicit.retain(|p| p.concept != concept);
    }

    pub fn state(&self) -> &GroundingState {
        &self.state
    }

    pub fn restore(&mut self, state: GroundingState) {
        self.state = state;
    }
}
