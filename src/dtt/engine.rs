//! DTTManager：遍历与调度
//!
//! 每个周期：自底向上传播完成/失败（执行完成脚本）→ 检查根是否终止 → 优先服务注入的
//! grounding 节点 → 从入口点做最左可执行的深度优先选择 → 执行一个叶子。
//! 同一周期内至多执行一个 Request/Inform；Execute/Expect 可以透明地连续解决。
//!
//! 选择是 (模板, 概念状态, 焦点栈) 的纯函数；激活祖先、同步焦点栈等副作用只在执行时发生。

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::focus::FocusStack;
use super::predicate::{Condition, ConditionScope};
use super::script::{CompletionAction, RestoreSource, ValueSource};
use super::template::TaskTemplate;
use super::tree::DialogAgentTree;
use super::types::{
    AgentKind, AgentStatus, GroundingRole, NodeId, TimeoutPolicy, CONFIRM_CONCEPT,
};
use crate::concept::{BindingSource, Concept, ConceptStore, ConceptValue, ProposedBinding};
use crate::config::AppConfig;
use crate::core::DialogError;
use crate::grounding::{ConfirmationMode, GroundingManager, GroundingReport};
use crate::output::{OutputAction, SpeechAct};

/// 一个会话的可变对话状态：树、概念与 grounding
#[derive(Debug)]
pub struct DialogContext {
    pub tree: DialogAgentTree,
    pub concepts: ConceptStore,
    pub grounding: GroundingManager,
    pub turn: u64,
    /// 本轮事件中绑定且通过 grounding 的概念
    pub fresh: BTreeSet<String>,
}

impl DialogContext {
    pub fn instantiate(template: &TaskTemplate, config: &AppConfig) -> Result<Self, DialogError> {
        let mut concepts = ConceptStore::new();
        let tree = DialogAgentTree::instantiate(template, &mut concepts)?;
        let grounding = GroundingManager::from_config(&config.grounding, template)?;
        Ok(Self {
            tree,
            concepts,
            grounding,
            turn: 0,
            fresh: BTreeSet::new(),
        })
    }

    fn view(&self) -> EvalView<'_> {
        EvalView { ctx: self }
    }

    fn holds(&self, cond: &Option<Condition>) -> Option<bool> {
        cond.as_ref().map(|c| c.eval(&self.view()))
    }
}

struct EvalView<'a> {
    ctx: &'a DialogContext,
}

impl ConditionScope for EvalView<'_> {
    fn status(&self, id: NodeId) -> AgentStatus {
        self.ctx.tree.status(id)
    }

    fn concept_settled(&self, name: &str) -> bool {
        self.ctx.grounding.settled(&self.ctx.concepts, name)
    }

    fn concept_grounded(&self, name: &str) -> bool {
        self.ctx.concepts.is_grounded(name)
    }

    fn concept_updated(&self, name: &str) -> bool {
        self.ctx.fresh.contains(name) && self.ctx.concepts.is_available(name)
    }

    fn concept_value(&self, name: &str) -> Option<&ConceptValue> {
        self.ctx.concepts.value(name)
    }
}

/// RestoreConcept(TurnsAgo) 需要的历史快照来源
pub trait ConceptHistory {
    fn concept_at(&self, name: &str, turn: u64) -> Option<Concept>;
}

/// 没有快照可用时
pub struct NoHistory;

impl ConceptHistory for NoHistory {
    fn concept_at(&self, _name: &str, _turn: u64) -> Option<Concept> {
        None
    }
}

/// 调度参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub max_steps_per_turn: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 8,
            max_attempts: 3,
            max_steps_per_turn: 64,
        }
    }
}

impl From<&crate::config::SessionConfig> for EngineSettings {
    fn from(c: &crate::config::SessionConfig) -> Self {
        Self {
            request_timeout_secs: c.request_timeout_secs,
            max_attempts: c.max_attempts,
            max_steps_per_turn: c.max_steps_per_turn,
        }
    }
}

/// 选择结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// 执行该叶子
    Leaf(NodeId),
    /// 未执行即满足成功规则，直接完成
    Settle(NodeId),
    /// 有 Execute 在等待后端结果
    Blocked(NodeId),
    Nothing,
}

/// Execute 发出的后端调用
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub node: NodeId,
    pub call: String,
    pub inputs: BTreeMap<String, ConceptValue>,
}

/// Request 激活时启动的计时器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub node: NodeId,
    pub secs: u64,
}

/// 一个调度周期的结果
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub output: Option<OutputAction>,
    pub calls: Vec<BackendRequest>,
    pub arm: Vec<TimerRequest>,
    pub disarm: Vec<NodeId>,
    /// 根节点进入的终止状态
    pub finished: Option<AgentStatus>,
    pub blocked_on: Option<NodeId>,
    pub steps: usize,
}

/// 调度器自身的可快照状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub focus: FocusStack,
    pub redirect: Option<NodeId>,
    pub pending_injected: Vec<NodeId>,
    pub armed: BTreeSet<NodeId>,
}

/// 遍历与调度器
#[derive(Debug)]
pub struct DttManager {
    settings: EngineSettings,
    focus: FocusStack,
    redirect: Option<NodeId>,
    pending_injected: VecDeque<NodeId>,
    armed: BTreeSet<NodeId>,
    suppress_triggers: bool,
}

impl DttManager {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            focus: FocusStack::new(),
            redirect: None,
            pending_injected: VecDeque::new(),
            armed: BTreeSet::new(),
            suppress_triggers: false,
        }
    }

    pub fn focus(&self) -> &FocusStack {
        &self.focus
    }

    pub fn redirect(&self) -> Option<NodeId> {
        self.redirect
    }

    pub fn pending_injected(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.pending_injected.iter().copied()
    }

    /// 打断不可打断的 Inform 时，本轮不做触发式焦点转移
    pub fn suppress_triggers(&mut self, suppress: bool) {
        self.suppress_triggers = suppress;
    }

    pub fn capture(&self) -> EngineState {
        EngineState {
            focus: self.focus.clone(),
            redirect: self.redirect,
            pending_injected: self.pending_injected.iter().copied().collect(),
            armed: self.armed.clone(),
        }
    }

    pub fn apply(&mut self, state: &EngineState) {
        self.focus = state.focus.clone();
        self.redirect = state.redirect;
        self.pending_injected = state.pending_injected.iter().copied().collect();
        self.armed = state.armed.clone();
    }

    // ---- 选择（纯函数） ----

    fn eligible(&self, ctx: &DialogContext, id: NodeId) -> bool {
        let node = ctx.tree.node(id);
        ctx.holds(&node.precondition).unwrap_or(true) && ctx.holds(&node.trigger).unwrap_or(true)
    }

    fn success_holds(&self, ctx: &DialogContext, id: NodeId) -> bool {
        let node = ctx.tree.node(id);
        if let Some(v) = ctx.holds(&node.success) {
            return v;
        }
        match &node.kind {
            AgentKind::Agency => self.agency_default(ctx, id).0,
            AgentKind::Request { concept, .. } | AgentKind::Expect { concept } => {
                node.grounding.is_none() && ctx.grounding.settled(&ctx.concepts, concept)
            }
            AgentKind::Inform { .. } | AgentKind::Execute { .. } => false,
        }
    }

    fn failure_holds(&self, ctx: &DialogContext, id: NodeId) -> bool {
        let node = ctx.tree.node(id);
        if let Some(v) = ctx.holds(&node.failure) {
            return v;
        }
        node.kind.is_agency() && self.agency_default(ctx, id).1
    }

    /// (全部必需子节点完成, 任一必需子节点失败或中止)
    fn agency_default(&self, ctx: &DialogContext, id: NodeId) -> (bool, bool) {
        let children = &ctx.tree.node(id).children;
        let required: Vec<NodeId> = children
            .iter()
            .copied()
            .filter(|c| ctx.tree.node(*c).required)
            .collect();
        if required.is_empty() {
            let done = children.iter().all(|c| ctx.tree.status(*c).is_terminal());
            return (done, false);
        }
        let failed = required.iter().any(|c| {
            matches!(
                ctx.tree.status(*c),
                AgentStatus::Failed | AgentStatus::Aborted
            )
        });
        let completed = required
            .iter()
            .all(|c| ctx.tree.status(*c) == AgentStatus::Completed);
        (completed, failed)
    }

    /// 入口点依次为：重定向目标、触发命中、焦点栈自顶向下、根
    pub fn select(&self, ctx: &DialogContext) -> Selection {
        let mut starts = Vec::new();
        if let Some(r) = self.redirect {
            starts.push(r);
        }
        if !self.suppress_triggers {
            if let Some(t) = self.trigger_hit(ctx) {
                starts.push(t);
            }
        }
        starts.extend(self.focus.entries().iter().rev().copied());
        starts.push(ctx.tree.root());

        for start in starts {
            match self.search_from(ctx, start) {
                Selection::Nothing => continue,
                found => return found,
            }
        }
        Selection::Nothing
    }

    /// 先序第一个声明了触发条件、本轮触发、尚未运行且祖先未终止的节点
    fn trigger_hit(&self, ctx: &DialogContext) -> Option<NodeId> {
        ctx.tree.template_nodes().find(|id| {
            let node = ctx.tree.node(*id);
            node.trigger.is_some()
                && node.status() == AgentStatus::Inactive
                && self.eligible(ctx, *id)
                && !ctx
                    .tree
                    .ancestors(*id)
                    .iter()
                    .any(|a| ctx.tree.status(*a).is_terminal())
        })
    }

    fn search_from(&self, ctx: &DialogContext, start: NodeId) -> Selection {
        match ctx.tree.status(start) {
            AgentStatus::Inactive => {
                if !self.eligible(ctx, start) {
                    return Selection::Nothing;
                }
                if self.success_holds(ctx, start) {
                    return Selection::Settle(start);
                }
                self.search(ctx, start)
            }
            AgentStatus::Active => self.search(ctx, start),
            _ => Selection::Nothing,
        }
    }

    fn search(&self, ctx: &DialogContext, id: NodeId) -> Selection {
        let node = ctx.tree.node(id);
        let status = node.status();
        match &node.kind {
            AgentKind::Agency => {}
            AgentKind::Execute { .. } if status == AgentStatus::Active => {
                return Selection::Blocked(id)
            }
            AgentKind::Expect { .. } if status == AgentStatus::Active => return Selection::Nothing,
            _ => return Selection::Leaf(id),
        }

        for child in &node.children {
            let child = *child;
            match ctx.tree.status(child) {
                AgentStatus::Inactive => {
                    if !self.eligible(ctx, child) {
                        continue;
                    }
                    if self.success_holds(ctx, child) {
                        return Selection::Settle(child);
                    }
                }
                AgentStatus::Active => {}
                _ => continue,
            }
            match self.search(ctx, child) {
                Selection::Nothing => continue,
                found => return found,
            }
        }
        Selection::Nothing
    }

    // ---- 周期 ----

    /// 运行一个调度周期，直到产生一个输出、被 Execute 阻塞或无事可做
    pub fn run_cycle(
        &mut self,
        ctx: &mut DialogContext,
        history: &dyn ConceptHistory,
    ) -> Result<CycleOutcome, DialogError> {
        let mut out = CycleOutcome::default();
        loop {
            out.steps += 1;
            if out.steps > self.settings.max_steps_per_turn {
                return Err(DialogError::invariant(format!(
                    "turn {} exceeded {} scheduling steps",
                    ctx.turn, self.settings.max_steps_per_turn
                )));
            }

            self.propagate(ctx, history)?;

            let root_status = ctx.tree.status(ctx.tree.root());
            if root_status.is_terminal() {
                info!(turn = ctx.turn, status = ?root_status, "Dialog task finished");
                out.finished = Some(root_status);
                break;
            }
            if out.output.is_some() {
                break;
            }

            if let Some(id) = self.next_injected(ctx) {
                self.execute_leaf(ctx, id, &mut out, history)?;
                continue;
            }

            let selection = self.select(ctx);
            self.redirect = None;
            debug!(turn = ctx.turn, ?selection, "Selection");
            match selection {
                Selection::Leaf(id) => self.execute_leaf(ctx, id, &mut out, history)?,
                Selection::Settle(id) => {
                    self.activate_ancestors(ctx, id)?;
                    debug!(agent = %ctx.tree.node(id).path, "Success rule already holds");
                    self.terminate(ctx, id, AgentStatus::Completed, history)?;
                }
                Selection::Blocked(id) => {
                    out.blocked_on = Some(id);
                    break;
                }
                Selection::Nothing => break,
            }
        }

        self.refresh_timers(ctx, &mut out);
        self.refresh_expectations(ctx);
        if self.pending_injected.is_empty() && ctx.tree.compact_injected() {
            debug!("Injected grounding nodes reclaimed");
        }
        Ok(out)
    }

    fn next_injected(&mut self, ctx: &DialogContext) -> Option<NodeId> {
        while let Some(front) = self.pending_injected.front().copied() {
            if ctx.tree.get(front).map_or(true, |n| n.status().is_terminal()) {
                self.pending_injected.pop_front();
                continue;
            }
            return Some(front);
        }
        None
    }

    /// 自底向上反复求值活跃节点，直到没有状态变化
    fn propagate(
        &mut self,
        ctx: &mut DialogContext,
        history: &dyn ConceptHistory,
    ) -> Result<(), DialogError> {
        let mut rounds = 0;
        loop {
            let next = ctx
                .tree
                .post_order()
                .into_iter()
                .filter(|id| ctx.tree.status(*id) == AgentStatus::Active)
                .find_map(|id| {
                    if self.failure_holds(ctx, id) {
                        Some((id, AgentStatus::Failed))
                    } else if self.success_holds(ctx, id) {
                        Some((id, AgentStatus::Completed))
                    } else {
                        None
                    }
                });
            let Some((id, status)) = next else {
                return Ok(());
            };
            rounds += 1;
            if rounds > self.settings.max_steps_per_turn {
                return Err(DialogError::invariant("completion propagation does not settle"));
            }
            self.terminate(ctx, id, status, history)?;
        }
    }

    fn activate_ancestors(&mut self, ctx: &mut DialogContext, id: NodeId) -> Result<(), DialogError> {
        let chain = ctx.tree.ancestors(id);
        let mut agencies = Vec::with_capacity(chain.len());
        for a in chain {
            match ctx.tree.status(a) {
                AgentStatus::Inactive => {
                    ctx.tree.set_status(a, AgentStatus::Active)?;
                    debug!(agent = %ctx.tree.node(a).path, "Agency activated");
                    agencies.push(a);
                }
                AgentStatus::Active => agencies.push(a),
                _ => {}
            }
        }
        self.focus.sync(&agencies);
        Ok(())
    }

    fn execute_leaf(
        &mut self,
        ctx: &mut DialogContext,
        id: NodeId,
        out: &mut CycleOutcome,
        history: &dyn ConceptHistory,
    ) -> Result<(), DialogError> {
        self.activate_ancestors(ctx, id)?;
        let node = ctx.tree.node(id);
        let kind = node.kind.clone();
        let role = node.grounding.clone();
        let path = node.path.clone();
        if node.status() == AgentStatus::Inactive {
            ctx.tree.set_status(id, AgentStatus::Active)?;
        }

        match kind {
            AgentKind::Request {
                prompt,
                fillers,
                timeout_secs,
                max_attempts,
                ..
            } => {
                let attempts = ctx.tree.bump_attempts(id);
                let limit = max_attempts.unwrap_or(self.settings.max_attempts);
                if attempts > limit {
                    warn!(agent = %path, attempts, "Request exceeded max attempts");
                    return self.terminate(ctx, id, AgentStatus::Failed, history);
                }
                let act = match role {
                    Some(GroundingRole::ExplicitConfirm { .. }) => SpeechAct::ExplicitConfirm,
                    _ => SpeechAct::Request,
                };
                out.output = Some(self.output(ctx, &path, act, prompt, &fillers, true));
                let secs = timeout_secs.unwrap_or(self.settings.request_timeout_secs);
                if secs > 0 {
                    out.arm.push(TimerRequest { node: id, secs });
                    self.armed.insert(id);
                }
            }
            AgentKind::Inform {
                prompt,
                fillers,
                interruptable,
            } => {
                let act = match role {
                    Some(GroundingRole::ImplicitConfirm { .. }) => SpeechAct::ImplicitConfirm,
                    Some(GroundingRole::Clarify { .. }) => SpeechAct::Clarify,
                    _ => SpeechAct::Inform,
                };
                out.output = Some(self.output(ctx, &path, act, prompt, &fillers, interruptable));
                self.terminate(ctx, id, AgentStatus::Completed, history)?;
            }
            AgentKind::Execute { .. } => {
                if let Some(request) = Self::backend_request(ctx, id) {
                    info!(agent = %path, call = %request.call, "Dispatching backend call");
                    out.calls.push(request);
                }
            }
            AgentKind::Expect { concept } => {
                debug!(agent = %path, concept = %concept, "Expecting concept");
            }
            AgentKind::Agency => {
                return Err(DialogError::invariant(format!(
                    "agency '{}' selected as leaf",
                    path
                )))
            }
        }
        Ok(())
    }

    fn output(
        &self,
        ctx: &DialogContext,
        path: &str,
        act: SpeechAct,
        prompt: String,
        fillers: &[String],
        interruptable: bool,
    ) -> OutputAction {
        OutputAction {
            turn: ctx.turn,
            agent: path.to_string(),
            act,
            prompt,
            fillers: fillers
                .iter()
                .filter_map(|f| ctx.concepts.value(f).map(|v| (f.clone(), v.clone())))
                .collect(),
            interruptable,
        }
    }

    /// 节点进入终止状态：中止活跃后代、弹出焦点、执行完成脚本
    fn terminate(
        &mut self,
        ctx: &mut DialogContext,
        id: NodeId,
        status: AgentStatus,
        history: &dyn ConceptHistory,
    ) -> Result<(), DialogError> {
        ctx.tree.set_status(id, status)?;
        info!(turn = ctx.turn, agent = %ctx.tree.node(id).path, ?status, "Agent terminated");

        if ctx.tree.node(id).kind.is_agency() {
            for d in ctx.tree.subtree(id).into_iter().skip(1) {
                if ctx.tree.status(d) == AgentStatus::Active {
                    ctx.tree.set_status(d, AgentStatus::Aborted)?;
                }
            }
            let injected: Vec<NodeId> = ctx
                .tree
                .injected_nodes()
                .filter(|n| {
                    let node = ctx.tree.node(*n);
                    !node.status().is_terminal()
                        && node.parent.map_or(false, |p| p == id || ctx.tree.is_ancestor(id, p))
                })
                .collect();
            for n in injected {
                self.end_injected(ctx, n, AgentStatus::Aborted)?;
            }
            self.focus.pop_through(id);
        }

        if let Some(GroundingRole::ExplicitConfirm { concept }) = ctx.tree.node(id).grounding.clone() {
            if status != AgentStatus::Completed {
                let elicitor = ctx.grounding.abandon(&mut ctx.concepts, &concept)?;
                if status == AgentStatus::Failed {
                    if let Some(e) = elicitor {
                        self.reopen(ctx, e);
                    }
                }
            }
        }

        let actions = ctx.tree.node(id).on_completion.clone();
        for action in actions {
            self.apply_action(ctx, id, action, history)?;
        }
        Ok(())
    }

    fn end_injected(
        &mut self,
        ctx: &mut DialogContext,
        id: NodeId,
        status: AgentStatus,
    ) -> Result<(), DialogError> {
        ctx.tree.set_status(id, status)?;
        if let Some(GroundingRole::ExplicitConfirm { concept }) = ctx.tree.node(id).grounding.clone() {
            ctx.grounding.abandon(&mut ctx.concepts, &concept)?;
        }
        self.pending_injected.retain(|n| *n != id);
        Ok(())
    }

    fn reopen(&mut self, ctx: &mut DialogContext, target: NodeId) -> Vec<NodeId> {
        let reset = ctx.tree.reset_subtree(target);
        self.focus.pop_through(target);
        info!(agent = %ctx.tree.node(target).path, nodes = reset.len(), "Subtree reopened");
        reset
    }

    fn apply_action(
        &mut self,
        ctx: &mut DialogContext,
        owner: NodeId,
        action: CompletionAction,
        history: &dyn ConceptHistory,
    ) -> Result<(), DialogError> {
        debug!(agent = %ctx.tree.node(owner).path, ?action, "Completion script");
        match action {
            CompletionAction::Clear(names) => {
                for name in names {
                    ctx.concepts.clear(&name)?;
                    ctx.grounding.forget(&name);
                }
            }
            CompletionAction::RestoreConcept { concept, from } => {
                let restored = match from {
                    RestoreSource::PreviousBinding => {
                        ctx.concepts.restore_previous(&concept, ctx.turn)?
                    }
                    RestoreSource::TurnsAgo(n) => {
                        match history.concept_at(&concept, ctx.turn.saturating_sub(n)) {
                            Some(c) => {
                                ctx.concepts.replace(c)?;
                                true
                            }
                            None => false,
                        }
                    }
                };
                ctx.grounding.forget(&concept);
                if !restored {
                    warn!(concept = %concept, "Nothing to restore");
                }
            }
            CompletionAction::Reopen(target) => {
                self.reopen(ctx, target);
            }
            CompletionAction::Reset(target) => {
                self.reopen(ctx, target);
                let scope = ctx.tree.node(target).path.clone();
                for name in ctx.concepts.names_in_scope(&scope) {
                    if !ctx.concepts.is_grounded(&name) && ctx.concepts.is_available(&name) {
                        ctx.concepts.clear(&name)?;
                        ctx.grounding.forget(&name);
                    }
                }
            }
            CompletionAction::ContinueWith(target) => {
                if ctx.tree.status(target).is_terminal() {
                    debug!(agent = %ctx.tree.node(target).path, "Redirect target already terminal");
                } else {
                    self.redirect = Some(target);
                }
            }
            CompletionAction::SetConcept { concept, value } => {
                let resolved = match &value {
                    ValueSource::Literal(v) => Some(v.clone()),
                    ValueSource::Concept(src) => ctx.concepts.value(src).cloned(),
                    ValueSource::Select { array, index } => ctx
                        .concepts
                        .value(index)
                        .and_then(ConceptValue::as_i64)
                        .filter(|i| *i >= 1)
                        .and_then(|i| {
                            ctx.concepts
                                .value(array)
                                .and_then(|a| a.element(i as usize - 1))
                        }),
                };
                match resolved {
                    Some(v) => match ctx.concepts.set(&concept, v, BindingSource::Script, ctx.turn) {
                        Ok(()) => {
                            ctx.grounding.forget(&concept);
                            ctx.fresh.insert(concept);
                        }
                        Err(e) => warn!(error = %e, "SetConcept discarded"),
                    },
                    None => warn!(concept = %concept, ?value, "SetConcept source has no value"),
                }
            }
        }
        Ok(())
    }

    // ---- 外部输入 ----

    /// 为中档概念注入确认节点、为低档概念注入澄清节点
    pub fn inject_grounding(&mut self, ctx: &mut DialogContext, report: &GroundingReport) {
        for (concept, mode) in &report.confirm {
            let (kind, role) = match mode {
                ConfirmationMode::Explicit => (
                    AgentKind::Request {
                        concept: CONFIRM_CONCEPT.to_string(),
                        prompt: "explicit_confirm".to_string(),
                        fillers: vec![concept.clone()],
                        timeout_secs: None,
                        max_attempts: Some(ctx.grounding.max_confirm_attempts()),
                        on_timeout: TimeoutPolicy::Reprompt,
                    },
                    GroundingRole::ExplicitConfirm {
                        concept: concept.clone(),
                    },
                ),
                ConfirmationMode::Implicit => (
                    AgentKind::Inform {
                        prompt: "implicit_confirm".to_string(),
                        fillers: vec![concept.clone()],
                        interruptable: true,
                    },
                    GroundingRole::ImplicitConfirm {
                        concept: concept.clone(),
                    },
                ),
            };
            let parent = self.injection_parent(ctx, concept);
            let id = ctx.tree.inject(parent, kind, role);
            ctx.grounding.attach_node(concept, id);
            info!(concept = %concept, ?mode, node = %id, "Confirmation injected");
            self.pending_injected.push_back(id);
        }
        for concept in &report.rejected {
            let parent = self.injection_parent(ctx, concept);
            let id = ctx.tree.inject(
                parent,
                AgentKind::Inform {
                    prompt: "clarify".to_string(),
                    fillers: vec![concept.clone()],
                    interruptable: true,
                },
                GroundingRole::Clarify {
                    concept: concept.clone(),
                },
            );
            info!(concept = %concept, node = %id, "Clarification injected");
            self.pending_injected.push_back(id);
        }
    }

    /// 注入节点挂在期望该概念的叶子的父 Agency 下，否则挂在焦点栈顶
    fn injection_parent(&self, ctx: &DialogContext, concept: &str) -> NodeId {
        ctx.grounding
            .expectations()
            .get(concept)
            .and_then(|n| ctx.tree.get(*n))
            .and_then(|n| n.parent)
            .or_else(|| self.focus.top())
            .unwrap_or_else(|| ctx.tree.root())
    }

    /// 已得到回答的确认节点直接完成
    pub fn resolve_injected(
        &mut self,
        ctx: &mut DialogContext,
        nodes: &[NodeId],
    ) -> Result<(), DialogError> {
        for id in nodes {
            if ctx.tree.get(*id).map_or(false, |n| !n.status().is_terminal()) {
                ctx.tree.set_status(*id, AgentStatus::Completed)?;
            }
            self.pending_injected.retain(|n| n != id);
        }
        Ok(())
    }

    /// 确认被否认后重新打开原请求
    pub fn reopen_nodes(&mut self, ctx: &mut DialogContext, nodes: &[NodeId]) {
        for id in nodes {
            if ctx.tree.get(*id).is_some() {
                self.reopen(ctx, *id);
            }
        }
    }

    /// 后端结果：绑定声明的输出则完成，否则失败；返回是否被接受
    pub fn on_backend_result(
        &mut self,
        ctx: &mut DialogContext,
        node: NodeId,
        outcome: Result<Vec<ProposedBinding>, String>,
        history: &dyn ConceptHistory,
    ) -> Result<Vec<DialogError>, DialogError> {
        let Some(agent) = ctx.tree.get(node) else {
            return Ok(Vec::new());
        };
        let AgentKind::Execute { call, output, .. } = agent.kind.clone() else {
            return Err(DialogError::invariant(format!(
                "backend result for non-execute agent {}",
                node
            )));
        };
        if agent.status() != AgentStatus::Active {
            debug!(agent = %agent.path, "Ignoring result for inactive execute");
            return Ok(Vec::new());
        }

        let mut errors = Vec::new();
        let status = match outcome {
            Ok(bindings) => {
                for b in bindings {
                    match ctx
                        .concepts
                        .set(&b.concept, b.value, BindingSource::Backend, ctx.turn)
                    {
                        Ok(()) => {
                            ctx.grounding.forget(&b.concept);
                            ctx.fresh.insert(b.concept);
                        }
                        Err(e) => errors.push(e),
                    }
                }
                if ctx.fresh.contains(&output) {
                    AgentStatus::Completed
                } else {
                    errors.push(DialogError::Backend {
                        call: call.clone(),
                        reason: format!("result did not bind '{}'", output),
                    });
                    AgentStatus::Failed
                }
            }
            Err(reason) => {
                errors.push(DialogError::Backend { call, reason });
                AgentStatus::Failed
            }
        };
        self.terminate(ctx, node, status, history)?;
        Ok(errors)
    }

    /// Request 超时：按策略失败，或留待重新提示；返回计时器是否仍有效
    pub fn on_timeout(
        &mut self,
        ctx: &mut DialogContext,
        node: NodeId,
        history: &dyn ConceptHistory,
    ) -> Result<bool, DialogError> {
        if !self.armed.remove(&node) || ctx.tree.status(node) != AgentStatus::Active {
            return Ok(false);
        }
        let fail = matches!(
            ctx.tree.node(node).kind,
            AgentKind::Request {
                on_timeout: TimeoutPolicy::Fail,
                ..
            }
        );
        if fail {
            self.terminate(ctx, node, AgentStatus::Failed, history)?;
        }
        Ok(true)
    }

    /// 回滚之后仍处于计时状态的 Request（需要重新启动计时器）
    pub fn armed_timers(&self, ctx: &DialogContext) -> Vec<TimerRequest> {
        self.armed
            .iter()
            .filter_map(|id| {
                let node = ctx.tree.get(*id)?;
                match &node.kind {
                    AgentKind::Request { timeout_secs, .. } => Some(TimerRequest {
                        node: *id,
                        secs: timeout_secs.unwrap_or(self.settings.request_timeout_secs),
                    }),
                    _ => None,
                }
            })
            .filter(|t| t.secs > 0)
            .collect()
    }

    /// 回滚之后仍处于 active 的 Execute：按当前概念值重新构造调用，由调用方重新派发
    pub fn in_flight_calls(&self, ctx: &DialogContext) -> Vec<BackendRequest> {
        ctx.tree
            .template_nodes()
            .filter(|id| ctx.tree.status(*id) == AgentStatus::Active)
            .filter_map(|id| Self::backend_request(ctx, id))
            .collect()
    }

    fn backend_request(ctx: &DialogContext, id: NodeId) -> Option<BackendRequest> {
        let AgentKind::Execute { call, inputs, .. } = &ctx.tree.node(id).kind else {
            return None;
        };
        let inputs = inputs
            .iter()
            .filter(|name| ctx.grounding.settled(&ctx.concepts, name))
            .filter_map(|name| {
                ctx.concepts
                    .value(name)
                    .map(|v| (name.clone(), v.clone()))
            })
            .collect();
        Some(BackendRequest {
            node: id,
            call: call.clone(),
            inputs,
        })
    }

    fn refresh_timers(&mut self, ctx: &DialogContext, out: &mut CycleOutcome) {
        let stale: Vec<NodeId> = self
            .armed
            .iter()
            .copied()
            .filter(|n| ctx.tree.status(*n) != AgentStatus::Active)
            .collect();
        for n in stale {
            self.armed.remove(&n);
            out.disarm.push(n);
        }
    }

    /// 期望集合：活跃的 Request/Expect 关注的概念
    fn refresh_expectations(&self, ctx: &mut DialogContext) {
        let mut expectations = BTreeMap::new();
        for id in ctx.tree.template_nodes() {
            let node = ctx.tree.node(id);
            if node.status() != AgentStatus::Active {
                continue;
            }
            if let AgentKind::Request { concept, .. } | AgentKind::Expect { concept } = &node.kind {
                expectations.entry(concept.clone()).or_insert(id);
            }
        }
        ctx.grounding.set_expectations(expectations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::ConceptType;
    use crate::dtt::{AgentTemplate, Predicate, ScriptAction, TemplateBuilder};

    fn context(template: &TaskTemplate) -> DialogContext {
        DialogContext::instantiate(template, &AppConfig::default()).unwrap()
    }

    fn menu() -> TaskTemplate {
        TemplateBuilder::new("menu")
            .root(
                AgentTemplate::agency("Main")
                    .concept("item", ConceptType::String)
                    .concept("help", ConceptType::Bool)
                    .child(AgentTemplate::inform("Welcome", "welcome"))
                    .child(AgentTemplate::request("AskItem", "item", "ask_item"))
                    .child(
                        AgentTemplate::inform("Help", "help")
                            .optional()
                            .trigger(Predicate::updated("help")),
                    )
                    .child(AgentTemplate::inform("Bye", "bye").fillers(&["item"])),
            )
            .build()
            .unwrap()
    }

    fn bind(ctx: &mut DialogContext, name: &str, v: ConceptValue) {
        ctx.concepts
            .bind(name, v, 1.0, BindingSource::User, ctx.turn)
            .unwrap();
        ctx.concepts.commit(name).unwrap();
        ctx.fresh.insert(name.to_string());
    }

    #[test]
    fn test_left_most_selection_and_single_output() {
        let template = menu();
        let mut ctx = context(&template);
        let mut dtt = DttManager::new(EngineSettings::default());

        ctx.turn = 1;
        let out = dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        assert_eq!(out.output.unwrap().prompt, "welcome");

        ctx.turn = 2;
        let out = dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        let action = out.output.unwrap();
        assert_eq!(action.prompt, "ask_item");
        assert_eq!(out.arm.len(), 1);
        assert_eq!(dtt.focus().entries(), &[ctx.tree.root()]);
        assert!(ctx.grounding.is_expected("item"));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let template = menu();
        let a = context(&template);
        let b = context(&template);
        let dtt = DttManager::new(EngineSettings::default());
        assert_eq!(dtt.select(&a), dtt.select(&b));
        assert_eq!(dtt.select(&a), Selection::Leaf(NodeId(1)));
    }

    #[test]
    fn test_trigger_shifts_focus_then_completes() {
        let template = menu();
        let mut ctx = context(&template);
        let mut dtt = DttManager::new(EngineSettings::default());
        ctx.turn = 1;
        dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        ctx.turn = 2;
        dtt.run_cycle(&mut ctx, &NoHistory).unwrap();

        ctx.turn = 3;
        ctx.fresh.clear();
        bind(&mut ctx, "help", ConceptValue::Bool(true));
        let out = dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        assert_eq!(out.output.unwrap().prompt, "help");

        // trigger 不再触发，回到仍在等待的 AskItem
        ctx.turn = 4;
        ctx.fresh.clear();
        let out = dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        assert_eq!(out.output.unwrap().prompt, "ask_item");
        assert_eq!(ctx.tree.node(NodeId(2)).attempts(), 2);
    }

    #[test]
    fn test_request_fails_after_max_attempts() {
        let template = TemplateBuilder::new("ask")
            .root(
                AgentTemplate::agency("Main")
                    .concept("x", ConceptType::String)
                    .child(AgentTemplate::request("Ask", "x", "ask_x").max_attempts(2)),
            )
            .build()
            .unwrap();
        let mut ctx = context(&template);
        let mut dtt = DttManager::new(EngineSettings::default());
        for turn in 1..=2 {
            ctx.turn = turn;
            assert!(dtt.run_cycle(&mut ctx, &NoHistory).unwrap().output.is_some());
        }
        ctx.turn = 3;
        let out = dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        assert!(out.output.is_none());
        assert_eq!(out.finished, Some(AgentStatus::Failed));
        assert_eq!(out.disarm, vec![NodeId(1)]);
    }

    #[test]
    fn test_pre_satisfied_request_is_settled() {
        let template = menu();
        let mut ctx = context(&template);
        let mut dtt = DttManager::new(EngineSettings::default());
        bind(&mut ctx, "item", "tea".into());
        ctx.turn = 1;
        dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        ctx.turn = 2;
        let out = dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        let bye = out.output.unwrap();
        assert_eq!(bye.prompt, "bye");
        assert_eq!(bye.fillers.get("item"), Some(&ConceptValue::from("tea")));
        assert_eq!(ctx.tree.status(NodeId(2)), AgentStatus::Completed);
    }

    #[test]
    fn test_reset_clears_ungrounded_concepts_in_scope() {
        let template = TemplateBuilder::new("loop")
            .root(
                AgentTemplate::agency("Main")
                    .concept("kept", ConceptType::String)
                    .concept("scratch", ConceptType::String)
                    .child(
                        AgentTemplate::inform("Once", "once")
                            .on_completion(ScriptAction::Reset {
                                agent: Some("Main".into()),
                            }),
                    )
                    .child(AgentTemplate::expect("Wait", "kept")),
            )
            .build()
            .unwrap();
        let mut ctx = context(&template);
        let mut dtt = DttManager::new(EngineSettings::default());
        bind(&mut ctx, "kept", "a".into());
        ctx.concepts
            .set("scratch", "b".into(), BindingSource::Script, 0)
            .unwrap();
        ctx.turn = 1;
        let out = dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        assert_eq!(out.output.unwrap().prompt, "once");
        assert_eq!(ctx.tree.status(NodeId(1)), AgentStatus::Inactive);
        assert!(ctx.concepts.is_grounded("kept"));
        assert!(!ctx.concepts.is_available("scratch"));
    }

    #[test]
    fn test_execute_blocks_until_result() {
        let template = TemplateBuilder::new("search")
            .root(
                AgentTemplate::agency("Main")
                    .concept("q", ConceptType::String)
                    .concept("hits", ConceptType::Int)
                    .child(AgentTemplate::execute("Search", "search", &["q"], "hits"))
                    .child(AgentTemplate::inform("Show", "show").fillers(&["hits"])),
            )
            .build()
            .unwrap();
        let mut ctx = context(&template);
        let mut dtt = DttManager::new(EngineSettings::default());
        bind(&mut ctx, "q", "bank".into());
        ctx.turn = 1;
        let out = dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].inputs.get("q"), Some(&ConceptValue::from("bank")));
        assert_eq!(out.blocked_on, Some(NodeId(1)));

        ctx.turn = 2;
        let out = dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        assert!(out.calls.is_empty() && out.output.is_none());

        ctx.turn = 3;
        let errors = dtt
            .on_backend_result(
                &mut ctx,
                NodeId(1),
                Ok(vec![ProposedBinding::new("hits", ConceptValue::Int(2), 1.0)]),
                &NoHistory,
            )
            .unwrap();
        assert!(errors.is_empty());
        let out = dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        assert_eq!(out.output.unwrap().prompt, "show");
    }

    #[test]
    fn test_backend_error_fails_leaf_and_agency() {
        let template = TemplateBuilder::new("search")
            .root(
                AgentTemplate::agency("Main")
                    .concept("hits", ConceptType::Int)
                    .child(AgentTemplate::execute("Search", "search", &[], "hits")),
            )
            .build()
            .unwrap();
        let mut ctx = context(&template);
        let mut dtt = DttManager::new(EngineSettings::default());
        dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        let errors = dtt
            .on_backend_result(&mut ctx, NodeId(1), Err("down".into()), &NoHistory)
            .unwrap();
        assert!(matches!(errors[0], DialogError::Backend { .. }));
        let out = dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        assert_eq!(out.finished, Some(AgentStatus::Failed));
    }
}
