//! OutputManager：把每轮至多一个面向用户的动作交给外部生成/转发层
//!
//! 核心只给出 prompt 标识与填充概念，文本渲染与传输归适配器所有。

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::concept::ConceptValue;
use crate::core::DialogError;

/// 输出的对话行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechAct {
    Request,
    Inform,
    ExplicitConfirm,
    ImplicitConfirm,
    Clarify,
}

/// 一次面向用户的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputAction {
    pub turn: u64,
    /// 产生输出的 agent 路径
    pub agent: String,
    pub act: SpeechAct,
    pub prompt: String,
    pub fillers: BTreeMap<String, ConceptValue>,
    pub interruptable: bool,
}

impl OutputAction {
    /// 输出后是否等待用户发言
    pub fn takes_floor(&self) -> bool {
        matches!(self.act, SpeechAct::Request | SpeechAct::ExplicitConfirm)
    }
}

/// 输出的去向
pub trait OutputSink: Send + Debug {
    fn dispatch(&mut self, action: &OutputAction) -> Result<(), DialogError>;
}

/// 通过 channel 推送给宿主
#[derive(Debug)]
pub struct ChannelSink {
    session_id: String,
    tx: mpsc::UnboundedSender<(String, OutputAction)>,
}

impl ChannelSink {
    pub fn new(session_id: impl Into<String>, tx: mpsc::UnboundedSender<(String, OutputAction)>) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
        }
    }
}

impl OutputSink for ChannelSink {
    fn dispatch(&mut self, action: &OutputAction) -> Result<(), DialogError> {
        self.tx
            .send((self.session_id.clone(), action.clone()))
            .map_err(|_| DialogError::SessionClosed(self.session_id.clone()))
    }
}

/// 每轮至多派发一次；未设置 sink 时输出留在 outbox 等待 PollOutput
#[derive(Debug, Default)]
pub struct OutputManager {
    sink: Option<Box<dyn OutputSink>>,
    outbox: VecDeque<OutputAction>,
    last: Option<OutputAction>,
    dispatched: u64,
}

impl OutputManager {
    pub fn buffered() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Box<dyn OutputSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::default()
        }
    }

    pub fn dispatch(&mut self, action: OutputAction) -> Result<(), DialogError> {
        if let Some(last) = &self.last {
            if last.turn == action.turn {
                return Err(DialogError::invariant(format!(
                    "second output in turn {} from '{}'",
                    action.turn, action.agent
                )));
            }
        }
        info!(turn = action.turn, agent = %action.agent, act = ?action.act, prompt = %action.prompt, "Dispatching output");
        match &mut self.sink {
            Some(sink) => sink.dispatch(&action)?,
            None => self.outbox.push_back(action.clone()),
        }
        self.dispatched += 1;
        self.last = Some(action);
        Ok(())
    }

    pub fn poll(&mut self) -> Option<OutputAction> {
        self.outbox.pop_front()
    }

    pub fn drain(&mut self) -> Vec<OutputAction> {
        self.outbox.drain(..).collect()
    }

    pub fn last_dispatched(&self) -> Option<&OutputAction> {
        self.last.as_ref()
    }

    /// 上一个输出是否是不可打断的 Inform
    pub fn last_was_non_interruptable(&self) -> bool {
        self.last
            .as_ref()
            .map(|a| a.act == SpeechAct::Inform && !a.interruptable)
            .unwrap_or(false)
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched
    }

    /// 会话回滚后允许在恢复的轮次重新输出
    pub fn rewind(&mut self) {
        debug!("Output history rewound");
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(turn: u64) -> OutputAction {
        OutputAction {
            turn,
            agent: "/Navi/RequestPoi".into(),
            act: SpeechAct::Request,
            prompt: "ask_poi".into(),
            fillers: BTreeMap::new(),
            interruptable: true,
        }
    }

    #[test]
    fn test_one_output_per_turn() {
        let mut m = OutputManager::buffered();
        m.dispatch(action(1)).unwrap();
        assert!(matches!(
            m.dispatch(action(1)),
            Err(DialogError::InvariantViolation(_))
        ));
        m.dispatch(action(2)).unwrap();
        assert_eq!(m.dispatched_count(), 2);
        assert_eq!(m.poll().map(|a| a.turn), Some(1));
        assert_eq!(m.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut m = OutputManager::with_sink(Box::new(ChannelSink::new("s1", tx)));
        m.dispatch(action(1)).unwrap();
        let (sid, out) = rx.recv().await.unwrap();
        assert_eq!(sid, "s1");
        assert_eq!(out.prompt, "ask_poi");
        assert!(out.takes_floor());
    }
}
