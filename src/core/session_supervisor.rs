//! 会话监管：生命周期、取消管理
//!
//! 每个会话持有一个 CancellationToken；计时器与后端调用各用一个子 token，
//! 可单独撤销，中止会话时随父 token 一起取消。

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dtt::NodeId;

/// 会话级取消令牌与按节点登记的子令牌
#[derive(Debug)]
pub struct SessionSupervisor {
    session_id: String,
    cancel_token: CancellationToken,
    timers: HashMap<NodeId, CancellationToken>,
    calls: HashMap<NodeId, CancellationToken>,
}

impl SessionSupervisor {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cancel_token: CancellationToken::new(),
            timers: HashMap::new(),
            calls: HashMap::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 为节点的新计时器取子 token，旧计时器随之取消
    pub fn timer_token(&mut self, node: NodeId) -> CancellationToken {
        let token = self.child_token();
        if let Some(old) = self.timers.insert(node, token.clone()) {
            old.cancel();
        }
        token
    }

    pub fn cancel_timer(&mut self, node: NodeId) {
        if let Some(token) = self.timers.remove(&node) {
            token.cancel();
        }
    }

    /// 每个 Execute 同时至多一个调用
    pub fn call_token(&mut self, node: NodeId) -> CancellationToken {
        let token = self.child_token();
        if let Some(old) = self.calls.insert(node, token.clone()) {
            old.cancel();
        }
        token
    }

    pub fn cancel_call(&mut self, node: NodeId) {
        if let Some(token) = self.calls.remove(&node) {
            token.cancel();
        }
    }

    /// 回滚时撤销全部未完成调用
    pub fn cancel_calls(&mut self) {
        for (_, token) in self.calls.drain() {
            token.cancel();
        }
    }

    pub fn active_timers(&self) -> usize {
        self.timers.values().filter(|t| !t.is_cancelled()).count()
    }

    pub fn active_calls(&self) -> usize {
        self.calls.values().filter(|t| !t.is_cancelled()).count()
    }

    /// 中止会话：取消全部计时器与后端调用
    pub fn cancel(&mut self) {
        debug!(
            session = %self.session_id,
            timers = self.timers.len(),
            calls = self.calls.len(),
            "Cancelling session tasks"
        );
        self.cancel_token.cancel();
        self.timers.clear();
        self.calls.clear();
    }
}
