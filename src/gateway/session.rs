//! 会话句柄
//!
//! 宿主通过句柄向会话任务发送命令；会话状态经 watch 通道对外可见。

use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::core::{DialogError, SessionStatus};
use crate::interaction::InteractionEvent;
use crate::output::OutputAction;

/// 会话 ID
pub type SessionId = String;

/// 发往会话任务的命令
#[derive(Debug)]
pub enum SessionCommand {
    /// 投递事件；事件处理完（含由它引出的 Resume）后回复
    Post(InteractionEvent, oneshot::Sender<Result<(), DialogError>>),
    Poll(oneshot::Sender<Option<OutputAction>>),
    Restore(u64, oneshot::Sender<Result<(), DialogError>>),
    Abort(String, oneshot::Sender<()>),
}

/// 宿主侧持有的会话句柄
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub template: String,
    tx: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
    created_at: Instant,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        template: String,
        tx: mpsc::UnboundedSender<SessionCommand>,
        status: watch::Receiver<SessionStatus>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            template,
            tx,
            status,
            task,
            created_at: Instant::now(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// 订阅状态变化
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.task.is_finished()
    }

    fn closed(&self) -> DialogError {
        DialogError::SessionClosed(self.id.clone())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, DialogError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn post(&self, event: InteractionEvent) -> Result<(), DialogError> {
        self.request(|reply| SessionCommand::Post(event, reply)).await?
    }

    pub async fn poll(&self) -> Result<Option<OutputAction>, DialogError> {
        self.request(SessionCommand::Poll).await
    }

    pub async fn restore(&self, turn: u64) -> Result<(), DialogError> {
        self.request(|reply| SessionCommand::Restore(turn, reply)).await?
    }

    pub async fn abort(&self, reason: impl Into<String>) -> Result<(), DialogError> {
        let reason = reason.into();
        self.request(|reply| SessionCommand::Abort(reason, reply)).await
    }
}
