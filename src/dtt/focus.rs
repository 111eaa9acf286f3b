//! 焦点栈：当前活跃 Agency 的有序引用（栈顶为遍历恢复点）

use serde::{Deserialize, Serialize};

use super::types::NodeId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusStack {
    entries: Vec<NodeId>,
}

impl FocusStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn top(&self) -> Option<NodeId> {
        self.entries.last().copied()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.contains(&id)
    }

    /// 自底向上
    pub fn entries(&self) -> &[NodeId] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, id: NodeId) {
        if self.top() != Some(id) {
            self.entries.push(id);
        }
    }

    /// 弹出 id 以及压在它之上的所有条目；id 不在栈中时不变
    pub fn pop_through(&mut self, id: NodeId) -> Vec<NodeId> {
        match self.entries.iter().position(|e| *e == id) {
            Some(pos) => self.entries.split_off(pos),
            None => Vec::new(),
        }
    }

    /// 将栈同步为给定的 Agency 链（根在前）：保留公共前缀，其余替换
    pub fn sync(&mut self, chain: &[NodeId]) {
        let common = self
            .entries
            .iter()
            .zip(chain)
            .take_while(|(a, b)| a == b)
            .count();
        self.entries.truncate(common);
        self.entries.extend_from_slice(&chain[common..]);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_through() {
        let mut f = FocusStack::new();
        f.push(NodeId(0));
        f.push(NodeId(1));
        f.push(NodeId(1));
        f.push(NodeId(4));
        assert_eq!(f.entries(), &[NodeId(0), NodeId(1), NodeId(4)]);
        assert_eq!(f.pop_through(NodeId(1)), vec![NodeId(1), NodeId(4)]);
        assert_eq!(f.top(), Some(NodeId(0)));
        assert!(f.pop_through(NodeId(7)).is_empty());
    }

    #[test]
    fn test_sync_keeps_common_prefix() {
        let mut f = FocusStack::new();
        f.sync(&[NodeId(0), NodeId(1), NodeId(2)]);
        f.sync(&[NodeId(0), NodeId(5)]);
        assert_eq!(f.entries(), &[NodeId(0), NodeId(5)]);
    }
}
