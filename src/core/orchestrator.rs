//! DMCore 主控循环：单会话的事件处理
//!
//! 每个事件完整跑完一轮：应用绑定 → grounding → 一个调度周期 → 输出 → 快照，
//! 然后才取下一个事件。`DialogSession` 本身是同步的、确定性的；
//! 后端调用与计时器以 [`DispatchedCall`] / [`TimerCommand`] 的形式交给宿主执行，
//! 结果再作为普通事件投递回来。

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::concept::{BindingSource, ConceptValue, ProposedBinding};
use crate::config::{AppConfig, SessionConfig};
use crate::core::{DialogError, RecoveryAction, RecoveryEngine, StateManager};
use crate::dtt::{
    AgentKind, AgentStatus, DialogContext, DttManager, EngineSettings, NodeId, TaskTemplate,
    TimeoutPolicy,
};
use crate::interaction::{InteractionEvent, InteractionEventManager};
use crate::output::{OutputAction, OutputManager};

/// 会话状态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    /// 根节点进入终止状态
    Finished { outcome: AgentStatus },
    Aborted { reason: String },
}

impl SessionStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionStatus::Running)
    }
}

/// 交给宿主执行的后端调用
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedCall {
    pub node: NodeId,
    pub call_id: u64,
    pub call: String,
    pub inputs: BTreeMap<String, ConceptValue>,
}

/// 交给宿主执行的计时器操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Arm { node: NodeId, generation: u64, secs: u64 },
    Disarm { node: NodeId },
}

/// 一个事件处理完后的结果
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub turn: u64,
    pub event: &'static str,
    pub output: Option<OutputAction>,
    pub calls: Vec<DispatchedCall>,
    /// 因所属节点不再活跃而撤销的调用
    pub cancelled_calls: Vec<NodeId>,
    pub timers: Vec<TimerCommand>,
    /// 本轮被恢复引擎处置的非致命错误（以及导致中止的致命错误）
    pub errors: Vec<DialogError>,
    pub status: SessionStatus,
}

impl TurnReport {
    fn new(turn: u64, event: &'static str) -> Self {
        Self {
            turn,
            event,
            output: None,
            calls: Vec::new(),
            cancelled_calls: Vec::new(),
            timers: Vec::new(),
            errors: Vec::new(),
            status: SessionStatus::Running,
        }
    }
}

/// 回滚后宿主需要重新建立的计时器与后端调用
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    pub turn: u64,
    pub timers: Vec<TimerCommand>,
    pub calls: Vec<DispatchedCall>,
}

/// 一个对话会话：概念、树、焦点栈、快照、事件队列与输出都归它独占
#[derive(Debug)]
pub struct DialogSession {
    id: String,
    template: String,
    settings: SessionConfig,
    ctx: DialogContext,
    dtt: DttManager,
    states: StateManager,
    events: InteractionEventManager,
    output: OutputManager,
    recovery: RecoveryEngine,
    status: SessionStatus,
}

impl DialogSession {
    /// 实例化模板；配置或模板不合法时会话不会启动
    pub fn new(
        id: impl Into<String>,
        template: &TaskTemplate,
        config: &AppConfig,
    ) -> Result<Self, DialogError> {
        config.validate()?;
        let id = id.into();
        let ctx = DialogContext::instantiate(template, config)?;
        let dtt = DttManager::new(EngineSettings::from(&config.session));
        let mut states = StateManager::new(config.session.max_snapshots);
        states.snapshot(&ctx, &dtt);
        info!(session = %id, template = %template.name, nodes = ctx.tree.len(), "Session created");
        Ok(Self {
            id,
            template: template.name.clone(),
            settings: config.session.clone(),
            ctx,
            dtt,
            states,
            events: InteractionEventManager::new(),
            output: OutputManager::buffered(),
            recovery: RecoveryEngine::new(),
            status: SessionStatus::Running,
        })
    }

    /// 替换输出去向（默认缓存在 outbox 等待 poll）
    pub fn with_output(mut self, output: OutputManager) -> Self {
        self.output = output;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn turn(&self) -> u64 {
        self.ctx.turn
    }

    pub fn context(&self) -> &DialogContext {
        &self.ctx
    }

    pub fn engine(&self) -> &DttManager {
        &self.dtt
    }

    pub fn states(&self) -> &StateManager {
        &self.states
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// 投递第一个 Resume，让根 Agency 开始执行
    pub fn start(&mut self) -> Result<Vec<TurnReport>, DialogError> {
        self.post(InteractionEvent::Resume)?;
        Ok(self.run_pending())
    }

    pub fn post(&mut self, event: InteractionEvent) -> Result<(), DialogError> {
        if !self.status.is_running() {
            return Err(DialogError::SessionClosed(self.id.clone()));
        }
        self.events.post(event);
        Ok(())
    }

    /// 投递并立即处理，直到队列为空
    pub fn handle(&mut self, event: InteractionEvent) -> Result<Vec<TurnReport>, DialogError> {
        self.post(event)?;
        Ok(self.run_pending())
    }

    pub fn run_pending(&mut self) -> Vec<TurnReport> {
        let mut reports = Vec::new();
        while let Some(report) = self.step() {
            reports.push(report);
        }
        reports
    }

    /// 处理队列中的下一个有效事件
    pub fn step(&mut self) -> Option<TurnReport> {
        if !self.status.is_running() {
            return None;
        }
        let event = self.events.next()?;
        Some(self.process(event))
    }

    pub fn poll_output(&mut self) -> Option<OutputAction> {
        self.output.poll()
    }

    pub fn drain_output(&mut self) -> Vec<OutputAction> {
        self.output.drain()
    }

    pub fn last_output(&self) -> Option<&OutputAction> {
        self.output.last_dispatched()
    }

    /// 中止会话：丢弃队列、计时器、未完成调用与快照
    pub fn abort(&mut self, reason: impl Into<String>) -> Vec<TimerCommand> {
        let reason = reason.into();
        let timers = self.shutdown(SessionStatus::Aborted {
            reason: reason.clone(),
        });
        self.states.clear();
        warn!(session = %self.id, reason = %reason, "Session aborted");
        timers
    }

    /// 整体回滚到第 turn 轮结束时的状态
    ///
    /// 节点状态与快照一致；快照中仍在等待结果的 Execute 以新的调用号重新派发，
    /// 旧调用的结果到达时按过期丢弃。
    pub fn restore(&mut self, turn: u64) -> Result<RestoreReport, DialogError> {
        if matches!(self.status, SessionStatus::Aborted { .. }) {
            return Err(DialogError::SessionClosed(self.id.clone()));
        }
        self.states.restore(turn, &mut self.ctx, &mut self.dtt)?;
        let mut report = RestoreReport {
            turn,
            ..Default::default()
        };
        report.timers = self
            .events
            .armed()
            .map(|(node, _)| TimerCommand::Disarm { node })
            .collect();
        self.events.reset();
        self.output.rewind();
        for t in self.dtt.armed_timers(&self.ctx) {
            let generation = self.events.arm(t.node);
            report.timers.push(TimerCommand::Arm {
                node: t.node,
                generation,
                secs: t.secs,
            });
        }
        for call in self.dtt.in_flight_calls(&self.ctx) {
            let call_id = self.events.register_call(call.node);
            debug!(node = %call.node, call_id, call = %call.call, "Backend call re-dispatched");
            report.calls.push(DispatchedCall {
                node: call.node,
                call_id,
                call: call.call,
                inputs: call.inputs,
            });
        }
        self.status = SessionStatus::Running;
        info!(session = %self.id, turn, calls = report.calls.len(), "Session rolled back");
        Ok(report)
    }

    fn process(&mut self, event: InteractionEvent) -> TurnReport {
        self.ctx.turn += 1;
        self.ctx.fresh.clear();
        let turn = self.ctx.turn;
        let span = info_span!("turn", session = %self.id, turn);
        let _guard = span.enter();
        debug!(event = event.kind(), "Processing event");

        let mut report = TurnReport::new(turn, event.kind());
        if let Err(e) = self.apply_event(event, &mut report) {
            self.recover(e, &mut report);
        }
        if self.status.is_running() {
            if let Err(e) = self.cycle(&mut report) {
                self.recover(e, &mut report);
            }
        }
        if !matches!(self.status, SessionStatus::Aborted { .. }) {
            self.states.snapshot(&self.ctx, &self.dtt);
        }
        report.status = self.status.clone();
        report
    }

    fn apply_event(
        &mut self,
        event: InteractionEvent,
        report: &mut TurnReport,
    ) -> Result<(), DialogError> {
        match event {
            InteractionEvent::UserUtterance { bindings, barge_in } => {
                self.apply_utterance(bindings, barge_in, report)
            }
            InteractionEvent::BackendResult { node, outcome, .. } => {
                let errors = self.dtt.on_backend_result(
                    &mut self.ctx,
                    node,
                    outcome.into_result(),
                    &self.states,
                )?;
                for e in errors {
                    let action = self.recovery.handle(&e);
                    warn!(error = %e, ?action, "Backend call did not succeed");
                    report.errors.push(e);
                }
                Ok(())
            }
            InteractionEvent::Timeout { node, .. } => {
                let (agent, policy) = match self.ctx.tree.get(node) {
                    Some(n) => match &n.kind {
                        AgentKind::Request { on_timeout, .. } => (n.path.clone(), *on_timeout),
                        _ => (n.path.clone(), TimeoutPolicy::Reprompt),
                    },
                    None => return Ok(()),
                };
                if self.dtt.on_timeout(&mut self.ctx, node, &self.states)? {
                    let err = DialogError::Timeout { agent };
                    let action = self.recovery.handle_timeout(&err, policy);
                    info!(error = %err, ?action, "Request timed out");
                    report.errors.push(err);
                }
                Ok(())
            }
            InteractionEvent::Resume => Ok(()),
        }
    }

    fn apply_utterance(
        &mut self,
        mut bindings: Vec<ProposedBinding>,
        barge_in: bool,
        report: &mut TurnReport,
    ) -> Result<(), DialogError> {
        if barge_in && self.output.last_was_non_interruptable() {
            debug!("Barge-in over non-interruptable output, triggers suppressed");
            self.dtt.suppress_triggers(true);
        }
        for b in &mut bindings {
            b.confidence = b.confidence.clamp(0.0, 1.0);
        }

        let settlement = self.ctx.grounding.settle(&mut self.ctx.concepts, bindings)?;
        self.dtt
            .resolve_injected(&mut self.ctx, &settlement.resolved_nodes)?;
        self.dtt.reopen_nodes(&mut self.ctx, &settlement.reopen);
        self.ctx.fresh.extend(settlement.committed.iter().cloned());

        let outcome = self.ctx.concepts.bind_batch(
            &settlement.remaining,
            BindingSource::User,
            self.ctx.turn,
        );
        for e in outcome.rejected {
            let action = self.recovery.handle(&e);
            warn!(error = %e, ?action, "Binding discarded");
            report.errors.push(e);
        }

        let grounding = self.ctx.grounding.ground(&mut self.ctx.concepts, &outcome.bound)?;
        let surviving: Vec<String> = grounding.surviving().map(str::to_string).collect();
        self.ctx.fresh.extend(surviving);
        self.dtt.inject_grounding(&mut self.ctx, &grounding);
        Ok(())
    }

    fn cycle(&mut self, report: &mut TurnReport) -> Result<(), DialogError> {
        let outcome = self.dtt.run_cycle(&mut self.ctx, &self.states);
        self.dtt.suppress_triggers(false);
        let outcome = outcome?;

        for node in outcome.disarm {
            if self.events.disarm(node) {
                debug!(%node, "Timer disarmed");
                report.timers.push(TimerCommand::Disarm { node });
            }
        }
        for t in outcome.arm {
            let generation = self.events.arm(t.node);
            debug!(node = %t.node, generation, secs = t.secs, "Timer armed");
            report.timers.push(TimerCommand::Arm {
                node: t.node,
                generation,
                secs: t.secs,
            });
        }

        for call in outcome.calls {
            let call_id = self.events.register_call(call.node);
            report.calls.push(DispatchedCall {
                node: call.node,
                call_id,
                call: call.call,
                inputs: call.inputs,
            });
        }
        let tree = &self.ctx.tree;
        report.cancelled_calls = self.events.retain_calls(|n| {
            tree.get(n)
                .map_or(false, |node| node.status() == AgentStatus::Active)
        });

        if let Some(action) = outcome.output {
            let resume = self.settings.auto_resume_after_inform
                && !action.takes_floor()
                && outcome.finished.is_none();
            if let Err(e) = self.output.dispatch(action.clone()) {
                // sink 已关闭，无人接收输出
                self.abort_turn(e, report);
                return Ok(());
            }
            report.output = Some(action);
            if resume {
                self.events.post(InteractionEvent::Resume);
            }
        }

        if let Some(outcome) = outcome.finished {
            info!(session = %self.id, ?outcome, "Session finished");
            let timers = self.shutdown(SessionStatus::Finished { outcome });
            report.timers.extend(timers);
        }
        Ok(())
    }

    fn recover(&mut self, err: DialogError, report: &mut TurnReport) {
        let action = self.recovery.handle(&err);
        match action {
            RecoveryAction::AbortSession => return self.abort_turn(err, report),
            _ => warn!(error = %err, ?action, "Recovered from error"),
        }
        report.errors.push(err);
    }

    fn abort_turn(&mut self, err: DialogError, report: &mut TurnReport) {
        error!(session = %self.id, error = %err, "Fatal error, aborting session");
        let timers = self.shutdown(SessionStatus::Aborted {
            reason: err.to_string(),
        });
        report.timers.extend(timers);
        self.states.clear();
        report.errors.push(err);
    }

    fn shutdown(&mut self, status: SessionStatus) -> Vec<TimerCommand> {
        let timers = self
            .events
            .armed()
            .map(|(node, _)| TimerCommand::Disarm { node })
            .collect();
        self.events.reset();
        self.status = status;
        timers
    }
}
