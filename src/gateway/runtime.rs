//! 会话运行时：每个会话一个 tokio 任务
//!
//! 任务独占一个 `DialogSession`，串行处理宿主命令与后端/计时器事件，
//! 因此同一会话的两个事件永远不会并发处理。`TurnReport` 中的调用与计时器
//! 交给 TaskScheduler 执行，取消令牌由 SessionSupervisor 管理。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::session::SessionCommand;
use crate::backend::Backend;
use crate::core::{
    DialogSession, DispatchedCall, SessionStatus, SessionSupervisor, TaskScheduler, TimerCommand,
    TurnReport,
};
use crate::interaction::InteractionEvent;

pub struct SessionRuntime {
    session: DialogSession,
    supervisor: SessionSupervisor,
    scheduler: TaskScheduler,
    backend: Arc<dyn Backend>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events_tx: mpsc::UnboundedSender<InteractionEvent>,
    events_rx: mpsc::UnboundedReceiver<InteractionEvent>,
    status: watch::Sender<SessionStatus>,
}

impl SessionRuntime {
    pub fn new(
        session: DialogSession,
        scheduler: TaskScheduler,
        backend: Arc<dyn Backend>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = SessionSupervisor::new(session.id());
        Self {
            session,
            supervisor,
            scheduler,
            backend,
            commands,
            events_tx,
            events_rx,
            status,
        }
    }

    /// 启动对话并处理命令，直到被中止或宿主丢弃句柄
    pub async fn run(mut self) {
        match self.session.start() {
            Ok(reports) => self.apply(reports),
            Err(e) => warn!(session = %self.session.id(), error = %e, "Session failed to start"),
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        self.shutdown("host dropped session handle");
                        break;
                    };
                    if !self.handle_command(cmd) {
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    if self.session.post(event).is_ok() {
                        let reports = self.session.run_pending();
                        self.apply(reports);
                    }
                }
            }
        }
        debug!(session = %self.session.id(), "Session task exited");
    }

    /// 返回 false 时结束任务
    fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Post(event, reply) => {
                let result = self.session.post(event);
                if result.is_ok() {
                    let reports = self.session.run_pending();
                    self.apply(reports);
                }
                reply.send(result).ok();
                true
            }
            SessionCommand::Poll(reply) => {
                reply.send(self.session.poll_output()).ok();
                true
            }
            SessionCommand::Restore(turn, reply) => {
                let result = match self.session.restore(turn) {
                    Ok(restored) => {
                        if self.supervisor.is_cancelled() {
                            self.supervisor = SessionSupervisor::new(self.session.id());
                        }
                        self.supervisor.cancel_calls();
                        self.apply_timers(restored.timers);
                        self.spawn_calls(restored.calls);
                        self.status.send_replace(self.session.status().clone());
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                reply.send(result).ok();
                true
            }
            SessionCommand::Abort(reason, reply) => {
                self.shutdown(&reason);
                reply.send(()).ok();
                false
            }
        }
    }

    fn apply(&mut self, reports: Vec<TurnReport>) {
        for report in reports {
            for e in &report.errors {
                debug!(session = %self.session.id(), turn = report.turn, error = %e, "Turn error");
            }
            for node in report.cancelled_calls {
                self.supervisor.cancel_call(node);
            }
            self.spawn_calls(report.calls);
            self.apply_timers(report.timers);
            if report.status != *self.status.borrow() {
                self.status.send_replace(report.status.clone());
            }
            if !report.status.is_running() {
                self.supervisor.cancel();
            }
        }
    }

    fn spawn_calls(&mut self, calls: Vec<DispatchedCall>) {
        for call in calls {
            info!(session = %self.session.id(), call = %call.call, node = %call.node, "Backend call started");
            let token = self.supervisor.call_token(call.node);
            self.scheduler.spawn_backend_call(
                self.backend.clone(),
                call,
                token,
                self.events_tx.clone(),
            );
        }
    }

    fn apply_timers(&mut self, timers: Vec<TimerCommand>) {
        for t in timers {
            match t {
                TimerCommand::Arm {
                    node,
                    generation,
                    secs,
                } => {
                    let token = self.supervisor.timer_token(node);
                    self.scheduler.spawn_timer(
                        node,
                        generation,
                        Duration::from_secs(secs),
                        token,
                        self.events_tx.clone(),
                    );
                }
                TimerCommand::Disarm { node } => self.supervisor.cancel_timer(node),
            }
        }
    }

    fn shutdown(&mut self, reason: &str) {
        if !matches!(self.session.status(), SessionStatus::Aborted { .. }) {
            self.session.abort(reason);
        }
        self.supervisor.cancel();
        self.status.send_replace(self.session.status().clone());
        info!(session = %self.session.id(), reason, "Session closed");
    }
}
