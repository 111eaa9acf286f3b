//! StateManager：每轮一个不可变快照
//!
//! 快照包含概念绑定、全部节点状态、焦点栈（以及调度与 grounding 的运行时状态），
//! 以 `Arc<DialogState>` 保存在环形缓冲中，创建后不再修改。

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::concept::{Concept, ConceptStore};
use crate::core::DialogError;
use crate::dtt::{ConceptHistory, DialogContext, DttManager, EngineState, TreeState};
use crate::grounding::GroundingState;

/// 某一轮结束时的完整对话状态
#[derive(Clone, Debug, Serialize)]
pub struct DialogState {
    pub turn: u64,
    pub concepts: ConceptStore,
    pub tree: TreeState,
    pub engine: EngineState,
    pub grounding: GroundingState,
    /// 毫秒时间戳
    pub created_at: i64,
}

impl DialogState {
    pub fn capture(ctx: &DialogContext, dtt: &DttManager) -> Self {
        Self {
            turn: ctx.turn,
            concepts: ctx.concepts.clone(),
            tree: ctx.tree.capture(),
            engine: dtt.capture(),
            grounding: ctx.grounding.state().clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 快照环形缓冲
#[derive(Debug)]
pub struct StateManager {
    snapshots: VecDeque<Arc<DialogState>>,
    capacity: usize,
}

impl StateManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// 记录当前轮的快照（同一轮重复记录时覆盖）
    pub fn snapshot(&mut self, ctx: &DialogContext, dtt: &DttManager) -> Arc<DialogState> {
        let state = Arc::new(DialogState::capture(ctx, dtt));
        if self.snapshots.back().map_or(false, |s| s.turn == state.turn) {
            self.snapshots.pop_back();
        }
        self.snapshots.push_back(state.clone());
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }
        debug!(turn = state.turn, kept = self.snapshots.len(), "Snapshot taken");
        state
    }

    pub fn get(&self, turn: u64) -> Option<Arc<DialogState>> {
        self.snapshots.iter().find(|s| s.turn == turn).cloned()
    }

    pub fn latest(&self) -> Option<Arc<DialogState>> {
        self.snapshots.back().cloned()
    }

    pub fn turns(&self) -> Vec<u64> {
        self.snapshots.iter().map(|s| s.turn).collect()
    }

    /// 整体替换活动状态为第 turn 轮的快照，并丢弃其后的快照
    pub fn restore(
        &mut self,
        turn: u64,
        ctx: &mut DialogContext,
        dtt: &mut DttManager,
    ) -> Result<(), DialogError> {
        let state = self.get(turn).ok_or(DialogError::SnapshotNotFound(turn))?;
        ctx.tree.apply(&state.tree)?;
        ctx.concepts = state.concepts.clone();
        ctx.grounding.restore(state.grounding.clone());
        ctx.turn = state.turn;
        ctx.fresh.clear();
        dtt.apply(&state.engine);
        self.snapshots.retain(|s| s.turn <= turn);
        info!(turn, "Dialog state restored");
        Ok(())
    }

    /// 只把一个概念恢复为第 turn 轮的样子，其余活动状态不变
    pub fn restore_concept(
        &self,
        name: &str,
        turn: u64,
        ctx: &mut DialogContext,
    ) -> Result<(), DialogError> {
        let concept = self
            .concept_at(name, turn)
            .ok_or(DialogError::SnapshotNotFound(turn))?;
        ctx.concepts.replace(concept)?;
        ctx.grounding.forget(name);
        debug!(concept = name, turn, "Concept restored from snapshot");
        Ok(())
    }

    /// 会话中止时丢弃全部快照
    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}

impl ConceptHistory for StateManager {
    /// 不晚于 turn 的最近快照中的概念
    fn concept_at(&self, name: &str, turn: u64) -> Option<Concept> {
        self.snapshots
            .iter()
            .rev()
            .find(|s| s.turn <= turn)
            .and_then(|s| s.concepts.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::{BindingSource, ConceptType, ConceptValue};
    use crate::config::AppConfig;
    use crate::dtt::{AgentTemplate, EngineSettings, NoHistory, TemplateBuilder};

    fn setup() -> (DialogContext, DttManager) {
        let template = TemplateBuilder::new("menu")
            .root(
                AgentTemplate::agency("Main")
                    .concept("item", ConceptType::String)
                    .child(AgentTemplate::request("AskItem", "item", "ask_item"))
                    .child(AgentTemplate::inform("Bye", "bye")),
            )
            .build()
            .unwrap();
        let ctx = DialogContext::instantiate(&template, &AppConfig::default()).unwrap();
        (ctx, DttManager::new(EngineSettings::default()))
    }

    #[test]
    fn test_restore_round_trip() {
        let (mut ctx, mut dtt) = setup();
        let mut states = StateManager::new(8);

        ctx.turn = 1;
        dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        let at_one = states.snapshot(&ctx, &dtt);

        ctx.turn = 2;
        ctx.concepts
            .bind("item", "tea".into(), 0.9, BindingSource::User, 2)
            .unwrap();
        ctx.concepts.commit("item").unwrap();
        dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        states.snapshot(&ctx, &dtt);
        assert_ne!(ctx.tree.capture(), at_one.tree);

        states.restore(1, &mut ctx, &mut dtt).unwrap();
        assert_eq!(ctx.concepts, at_one.concepts);
        assert_eq!(ctx.tree.capture(), at_one.tree);
        assert_eq!(dtt.capture(), at_one.engine);
        assert_eq!(ctx.turn, 1);
        assert_eq!(states.turns(), vec![1]);
    }

    #[test]
    fn test_restore_concept_only_touches_one_concept() {
        let (mut ctx, mut dtt) = setup();
        let mut states = StateManager::new(8);
        ctx.concepts
            .set("item", "tea".into(), BindingSource::Script, 1)
            .unwrap();
        ctx.turn = 1;
        states.snapshot(&ctx, &dtt);

        ctx.turn = 2;
        ctx.concepts.clear("item").unwrap();
        dtt.run_cycle(&mut ctx, &NoHistory).unwrap();
        let tree_before = ctx.tree.capture();

        states.restore_concept("item", 1, &mut ctx).unwrap();
        assert_eq!(ctx.concepts.value("item"), Some(&ConceptValue::from("tea")));
        assert_eq!(ctx.tree.capture(), tree_before);
        assert!(matches!(
            states.restore_concept("item", 0, &mut ctx),
            Err(DialogError::SnapshotNotFound(0))
        ));
    }

    #[test]
    fn test_ring_buffer_capacity() {
        let (mut ctx, dtt) = setup();
        let mut states = StateManager::new(2);
        for turn in 1..=4 {
            ctx.turn = turn;
            states.snapshot(&ctx, &dtt);
        }
        assert_eq!(states.turns(), vec![3, 4]);
        assert!(states.get(1).is_none());
    }
}
