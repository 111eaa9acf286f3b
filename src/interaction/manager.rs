//! InteractionEventManager
//!
//! 单会话的 FIFO 事件队列。计时器与后端调用都带代号，被撤销或被取代后到达的事件在出队时丢弃。

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use super::event::InteractionEvent;
use crate::dtt::NodeId;

#[derive(Debug, Default)]
pub struct InteractionEventManager {
    queue: VecDeque<InteractionEvent>,
    timers: HashMap<NodeId, u64>,
    next_generation: u64,
    calls: HashMap<NodeId, u64>,
    next_call_id: u64,
}

impl InteractionEventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, event: InteractionEvent) {
        debug!(kind = event.kind(), queued = self.queue.len(), "Event queued");
        self.queue.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 取下一个仍然有效的事件
    pub fn next(&mut self) -> Option<InteractionEvent> {
        while let Some(event) = self.queue.pop_front() {
            match &event {
                InteractionEvent::Timeout { node, generation } => {
                    if self.timers.get(node) != Some(generation) {
                        debug!(%node, generation, "Dropping stale timeout");
                        continue;
                    }
                    self.timers.remove(node);
                }
                InteractionEvent::BackendResult { node, call_id, .. } => {
                    if self.calls.get(node) != Some(call_id) {
                        debug!(%node, call_id, "Dropping stale backend result");
                        continue;
                    }
                    self.calls.remove(node);
                }
                _ => {}
            }
            return Some(event);
        }
        None
    }

    /// 为节点启动计时器，返回新代号（旧代号随之失效）
    pub fn arm(&mut self, node: NodeId) -> u64 {
        self.next_generation += 1;
        self.timers.insert(node, self.next_generation);
        self.next_generation
    }

    pub fn disarm(&mut self, node: NodeId) -> bool {
        self.timers.remove(&node).is_some()
    }

    pub fn armed(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.timers.iter().map(|(n, g)| (*n, *g))
    }

    /// 登记一次后端调用，返回调用号；每个 Execute 同时至多一个未完成调用
    pub fn register_call(&mut self, node: NodeId) -> u64 {
        self.next_call_id += 1;
        self.calls.insert(node, self.next_call_id);
        self.next_call_id
    }

    pub fn outstanding(&self, node: NodeId) -> Option<u64> {
        self.calls.get(&node).copied()
    }

    /// 只保留满足条件的未完成调用，返回被撤销的节点
    pub fn retain_calls(&mut self, keep: impl Fn(NodeId) -> bool) -> Vec<NodeId> {
        let dropped: Vec<NodeId> = self.calls.keys().copied().filter(|n| !keep(*n)).collect();
        for n in &dropped {
            self.calls.remove(n);
        }
        dropped
    }

    /// 清空队列、计时器与未完成调用（中止或回滚）
    pub fn reset(&mut self) {
        self.queue.clear();
        self.timers.clear();
        self.calls.clear();
    }
}
