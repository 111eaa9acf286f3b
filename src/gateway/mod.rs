//! 会话宿主（控制面）
//!
//! 对外提供 StartSession / PostEvent / PollOutput / AbortSession：
//! - 模板在注册时实例化一次做校验，之后以 `Arc<TaskTemplate>` 在会话间共享
//! - 每个会话是一个独立的 tokio 任务（见 [`runtime`]），会话之间不共享可变状态
//! - 后端调用并发上限在宿主内所有会话间共享

mod runtime;
mod session;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

use crate::backend::Backend;
use crate::config::AppConfig;
use crate::core::{DialogError, DialogSession, SessionStatus, TaskScheduler};
use crate::dtt::{DialogContext, TaskTemplate};
use crate::interaction::InteractionEvent;
use crate::output::{ChannelSink, OutputAction, OutputManager};

pub use runtime::SessionRuntime;
pub use session::{SessionCommand, SessionHandle, SessionId};

/// 多会话宿主
pub struct SessionHost {
    config: AppConfig,
    templates: RwLock<HashMap<String, Arc<TaskTemplate>>>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    backend: Arc<dyn Backend>,
    scheduler: TaskScheduler,
    /// 设置后输出直接推送到该通道，不再进入 PollOutput 的缓存
    output_tx: Option<mpsc::UnboundedSender<(SessionId, OutputAction)>>,
}

impl SessionHost {
    pub fn new(config: AppConfig, backend: Arc<dyn Backend>) -> Result<Self, DialogError> {
        config.validate()?;
        let scheduler = TaskScheduler::from_config(&config.session);
        Ok(Self {
            config,
            templates: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            backend,
            scheduler,
            output_tx: None,
        })
    }

    pub fn with_output_channel(mut self, tx: mpsc::UnboundedSender<(SessionId, OutputAction)>) -> Self {
        self.output_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 注册模板；不合法的模板在这里以 ConfigurationError 拒绝
    pub async fn register_template(&self, template: TaskTemplate) -> Result<(), DialogError> {
        template.validate()?;
        DialogContext::instantiate(&template, &self.config)?;
        info!(template = %template.name, nodes = template.node_count(), "Template registered");
        self.templates
            .write()
            .await
            .insert(template.name.clone(), Arc::new(template));
        Ok(())
    }

    /// 加载目录下所有 .json / .toml 模板，返回加载数量
    pub async fn load_templates_dir(&self, dir: impl AsRef<Path>) -> Result<usize, DialogError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            DialogError::config(format!("cannot read template dir {}: {}", dir.display(), e))
        })?;
        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("json") | Some("toml")
                )
            })
            .collect();
        paths.sort();
        let mut loaded = 0;
        for path in paths {
            let template = TaskTemplate::load(&path)?;
            self.register_template(template).await?;
            loaded += 1;
        }
        Ok(loaded)
    }

    pub async fn template_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.templates.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// StartSession：实例化模板并启动会话任务，返回会话 ID
    pub async fn start_session(&self, template_id: &str) -> Result<SessionId, DialogError> {
        let template = self
            .templates
            .read()
            .await
            .get(template_id)
            .cloned()
            .ok_or_else(|| DialogError::TemplateNotFound(template_id.to_string()))?;

        let id = format!("session_{}", uuid::Uuid::new_v4());
        let mut session = DialogSession::new(id.clone(), &template, &self.config)?;
        if let Some(tx) = &self.output_tx {
            session = session.with_output(OutputManager::with_sink(Box::new(ChannelSink::new(
                id.clone(),
                tx.clone(),
            ))));
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Running);
        let runtime = SessionRuntime::new(
            session,
            self.scheduler.clone(),
            self.backend.clone(),
            cmd_rx,
            status_tx,
        );
        let task = tokio::spawn(runtime.run());
        let handle = SessionHandle::new(id.clone(), template.name.clone(), cmd_tx, status_rx, task);
        self.sessions.write().await.insert(id.clone(), handle);
        info!(session = %id, template = %template.name, "Session started");
        Ok(id)
    }

    /// PostEvent：返回时事件（及其引出的 Resume）已处理完
    pub async fn post_event(&self, session_id: &str, event: InteractionEvent) -> Result<(), DialogError> {
        let sessions = self.sessions.read().await;
        let handle = Self::handle(&sessions, session_id)?;
        handle.post(event).await
    }

    /// PollOutput：取出最早一条未读输出
    pub async fn poll_output(&self, session_id: &str) -> Result<Option<OutputAction>, DialogError> {
        let sessions = self.sessions.read().await;
        Self::handle(&sessions, session_id)?.poll().await
    }

    /// AbortSession：取消该会话的全部计时器与后端调用，丢弃快照并移除会话
    pub async fn abort_session(&self, session_id: &str) -> Result<(), DialogError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| DialogError::SessionNotFound(session_id.to_string()))?;
        if let Err(e) = handle.abort("aborted by host").await {
            warn!(session = %session_id, error = %e, "Session task already gone");
        }
        Ok(())
    }

    /// 整体回滚到第 turn 轮
    pub async fn restore_session(&self, session_id: &str, turn: u64) -> Result<(), DialogError> {
        let sessions = self.sessions.read().await;
        Self::handle(&sessions, session_id)?.restore(turn).await
    }

    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus, DialogError> {
        let sessions = self.sessions.read().await;
        Ok(Self::handle(&sessions, session_id)?.status())
    }

    pub async fn watch_status(
        &self,
        session_id: &str,
    ) -> Result<watch::Receiver<SessionStatus>, DialogError> {
        let sessions = self.sessions.read().await;
        Ok(Self::handle(&sessions, session_id)?.watch_status())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 中止全部会话（进程退出时）
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.abort("host shutdown").await.ok();
        }
    }

    fn handle<'a>(
        sessions: &'a HashMap<SessionId, SessionHandle>,
        session_id: &str,
    ) -> Result<&'a SessionHandle, DialogError> {
        sessions
            .get(session_id)
            .ok_or_else(|| DialogError::SessionNotFound(session_id.to_string()))
    }
}
