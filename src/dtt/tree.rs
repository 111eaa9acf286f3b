//! Dialog Agent Tree
//!
//! 单一 arena 持有全部节点，父子关系与焦点栈都用 NodeId 引用，不存在重复所有权。
//! 模板节点按先序排列在 arena 前部；grounding 注入的确认/澄清叶子追加在尾部，
//! 它们挂在某个 Agency 下但不计入其子节点列表。

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::predicate::Condition;
use super::script::{CompletionAction, ScriptAction};
use super::template::{AgentTemplate, TaskTemplate};
use super::types::{AgentKind, AgentStatus, GroundingRole, NodeId, CONFIRM_CONCEPT, SYSTEM_SCOPE};
use crate::concept::{BindingSource, ConceptStore, ConceptType};
use crate::core::DialogError;

/// 树中的一个 agent 节点
#[derive(Debug, Clone)]
pub struct AgentNode {
    pub id: NodeId,
    pub name: String,
    pub path: String,
    pub kind: AgentKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub precondition: Option<Condition>,
    pub trigger: Option<Condition>,
    pub success: Option<Condition>,
    pub failure: Option<Condition>,
    pub on_completion: Vec<CompletionAction>,
    pub required: bool,
    /// 仅注入节点有值
    pub grounding: Option<GroundingRole>,
    status: AgentStatus,
    attempts: u32,
}

impl AgentNode {
    pub fn status(&self) -> AgentStatus {
        self.status
    }

    /// Request 已提示的次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_injected(&self) -> bool {
        self.grounding.is_some()
    }
}

/// 单个节点的运行时状态（快照用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: AgentStatus,
    pub attempts: u32,
}

/// 注入节点的可重建描述（快照用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectedNode {
    pub parent: NodeId,
    pub kind: AgentKind,
    pub role: GroundingRole,
}

/// 整棵树的运行时状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeState {
    pub nodes: Vec<NodeState>,
    pub injected: Vec<InjectedNode>,
}

/// 实例化后的 agent 树
#[derive(Debug, Clone)]
pub struct DialogAgentTree {
    nodes: Vec<AgentNode>,
    root: NodeId,
    static_len: usize,
    by_path: HashMap<String, NodeId>,
}

impl DialogAgentTree {
    /// 从模板实例化：声明概念、建立节点、编译谓词与脚本、检查不变量
    pub fn instantiate(
        template: &TaskTemplate,
        concepts: &mut ConceptStore,
    ) -> Result<Self, DialogError> {
        template.validate()?;
        concepts.declare(SYSTEM_SCOPE, CONFIRM_CONCEPT, ConceptType::Bool)?;

        let mut tree = Self {
            nodes: Vec::with_capacity(template.node_count()),
            root: NodeId(0),
            static_len: 0,
            by_path: HashMap::new(),
        };
        let mut sources: Vec<&AgentTemplate> = Vec::new();
        tree.add_subtree(&template.root, None, "", concepts, &mut sources)?;
        tree.static_len = tree.nodes.len();

        for (idx, agent) in sources.iter().enumerate() {
            tree.compile_node(NodeId(idx), agent, concepts)?;
        }
        tree.check_invariants()?;
        Ok(tree)
    }

    fn add_subtree<'t>(
        &mut self,
        agent: &'t AgentTemplate,
        parent: Option<NodeId>,
        parent_path: &str,
        concepts: &mut ConceptStore,
        sources: &mut Vec<&'t AgentTemplate>,
    ) -> Result<NodeId, DialogError> {
        let id = NodeId(self.nodes.len());
        let path = format!("{}/{}", parent_path, agent.name);

        for decl in &agent.concepts {
            concepts.declare(&path, &decl.name, decl.ty)?;
            if let Some(default) = &decl.default {
                concepts
                    .set(&decl.name, default.clone(), BindingSource::Script, 0)
                    .map_err(|e| DialogError::config(format!("default for {}", e)))?;
            }
        }

        self.nodes.push(AgentNode {
            id,
            name: agent.name.clone(),
            path: path.clone(),
            kind: agent.kind.clone(),
            parent,
            children: Vec::new(),
            precondition: None,
            trigger: None,
            success: None,
            failure: None,
            on_completion: Vec::new(),
            required: agent.required,
            grounding: None,
            status: AgentStatus::Inactive,
            attempts: 0,
        });
        if self.by_path.insert(path.clone(), id).is_some() {
            return Err(DialogError::invariant(format!("duplicate agent path '{}'", path)));
        }
        sources.push(agent);

        for child in &agent.children {
            let child_id = self.add_subtree(child, Some(id), &path, concepts, sources)?;
            self.nodes[id.0].children.push(child_id);
        }
        Ok(id)
    }

    fn compile_node(
        &mut self,
        id: NodeId,
        agent: &AgentTemplate,
        concepts: &ConceptStore,
    ) -> Result<(), DialogError> {
        let path = self.nodes[id.0].path.clone();
        let declared = |name: &str| concepts.contains(name);
        let require = |name: &str, what: &str| -> Result<(), DialogError> {
            if declared(name) {
                Ok(())
            } else {
                Err(DialogError::config(format!(
                    "{} '{}' of '{}' is not declared",
                    what, name, path
                )))
            }
        };

        match &agent.kind {
            AgentKind::Agency => {}
            AgentKind::Request { concept, fillers, .. } => {
                require(concept, "concept")?;
                for f in fillers {
                    require(f, "filler")?;
                }
            }
            AgentKind::Inform { fillers, .. } => {
                for f in fillers {
                    require(f, "filler")?;
                }
            }
            AgentKind::Execute { inputs, output, .. } => {
                for i in inputs {
                    require(i, "input")?;
                }
                require(output, "output")?;
            }
            AgentKind::Expect { concept } => require(concept, "concept")?,
        }

        let resolve = |name: &str| self.resolve_from(id, name);
        let compile = |p: &Option<super::predicate::Predicate>| -> Result<Option<Condition>, DialogError> {
            p.as_ref()
                .map(|p| Condition::compile(p, &resolve, &declared))
                .transpose()
                .map_err(|e| DialogError::config(format!("{} (in '{}')", e, path)))
        };
        let precondition = compile(&agent.precondition)?;
        let trigger = compile(&agent.trigger)?;
        let success = compile(&agent.success)?;
        let failure = compile(&agent.failure)?;

        let mut on_completion = Vec::with_capacity(agent.on_completion.len());
        for action in &agent.on_completion {
            on_completion.push(self.compile_action(id, action, concepts)?);
        }

        let node = &mut self.nodes[id.0];
        node.precondition = precondition;
        node.trigger = trigger;
        node.success = success;
        node.failure = failure;
        node.on_completion = on_completion;
        Ok(())
    }

    fn compile_action(
        &self,
        owner: NodeId,
        action: &ScriptAction,
        concepts: &ConceptStore,
    ) -> Result<CompletionAction, DialogError> {
        let path = &self.nodes[owner.0].path;
        let concept = |name: &str| -> Result<String, DialogError> {
            if concepts.contains(name) {
                Ok(name.to_string())
            } else {
                Err(DialogError::config(format!(
                    "script of '{}' references undeclared concept '{}'",
                    path, name
                )))
            }
        };
        let agent = |name: &Option<String>| -> Result<NodeId, DialogError> {
            match name {
                None => Ok(owner),
                Some(n) => self.resolve_from(owner, n).ok_or_else(|| {
                    DialogError::config(format!(
                        "script of '{}' references unknown agent '{}'",
                        path, n
                    ))
                }),
            }
        };

        Ok(match action {
            ScriptAction::Clear { concepts: names } => CompletionAction::Clear(
                names.iter().map(|n| concept(n)).collect::<Result<_, _>>()?,
            ),
            ScriptAction::RestoreConcept { concept: c, from } => CompletionAction::RestoreConcept {
                concept: concept(c)?,
                from: *from,
            },
            ScriptAction::Reset { agent: a } => CompletionAction::Reset(agent(a)?),
            ScriptAction::Reopen { agent: a } => CompletionAction::Reopen(agent(a)?),
            ScriptAction::ContinueWith { target } => {
                let id = agent(&Some(target.clone()))?;
                let sibling = self.nodes[id.0].parent == self.nodes[owner.0].parent;
                if !(sibling || id == owner || self.is_ancestor(id, owner)) {
                    return Err(DialogError::config(format!(
                        "continue_with target '{}' of '{}' is neither sibling nor ancestor",
                        target, path
                    )));
                }
                CompletionAction::ContinueWith(id)
            }
            ScriptAction::SetConcept { concept: c, value } => {
                use super::script::ValueSource;
                match value {
                    ValueSource::Literal(_) => {}
                    ValueSource::Concept(src) => {
                        concept(src)?;
                    }
                    ValueSource::Select { array, index } => {
                        concept(array)?;
                        concept(index)?;
                    }
                }
                CompletionAction::SetConcept {
                    concept: concept(c)?,
                    value: value.clone(),
                }
            }
        })
    }

    /// 相对名字解析：绝对路径；否则依次查子节点、兄弟、祖先、全树唯一名字
    pub fn resolve_from(&self, from: NodeId, name: &str) -> Option<NodeId> {
        if name.starts_with('/') {
            return self.by_path.get(name).copied();
        }
        let node = &self.nodes[from.0];
        if node.name == name {
            return Some(from);
        }
        if let Some(c) = node.children.iter().find(|c| self.nodes[c.0].name == name) {
            return Some(*c);
        }
        if let Some(parent) = node.parent {
            if let Some(s) = self.nodes[parent.0]
                .children
                .iter()
                .find(|c| self.nodes[c.0].name == name)
            {
                return Some(*s);
            }
        }
        if let Some(a) = self.ancestors(from).into_iter().find(|a| self.nodes[a.0].name == name) {
            return Some(a);
        }
        let mut matches = self.nodes[..self.static_len]
            .iter()
            .filter(|n| n.name == name)
            .map(|n| n.id);
        match (matches.next(), matches.next()) {
            (Some(id), None) => Some(id),
            _ => None,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &AgentNode {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&AgentNode> {
        self.nodes.get(id.0)
    }

    pub fn find(&self, path: &str) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn status(&self, id: NodeId) -> AgentStatus {
        self.nodes
            .get(id.0)
            .map(|n| n.status)
            .unwrap_or(AgentStatus::Inactive)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 模板节点 id（不含注入节点），先序
    pub fn template_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.static_len).map(NodeId)
    }

    /// 注入节点 id
    pub fn injected_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (self.static_len..self.nodes.len()).map(NodeId)
    }

    /// 根到 id 的祖先链（根在前，不含 id）
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cur = self.nodes[id.0].parent;
        while let Some(p) = cur {
            chain.push(p);
            cur = self.nodes[p.0].parent;
        }
        chain.reverse();
        chain
    }

    pub fn is_ancestor(&self, ancestor: NodeId, of: NodeId) -> bool {
        let mut cur = self.nodes[of.0].parent;
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.nodes[p.0].parent;
        }
        false
    }

    /// id 及其全部后代（先序）
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            out.push(n);
            for c in self.nodes[n.0].children.iter().rev() {
                stack.push(*c);
            }
        }
        out
    }

    /// 模板节点后序（子先于父），用于自底向上传播
    pub fn post_order(&self) -> Vec<NodeId> {
        let mut out = self.subtree(self.root);
        out.reverse();
        out
    }

    /// 状态迁移：inactive -> active -> 终止，或 inactive 直接终止；其余迁移只能经 reset
    pub fn set_status(&mut self, id: NodeId, status: AgentStatus) -> Result<(), DialogError> {
        let node = &mut self.nodes[id.0];
        let ok = match (node.status, status) {
            (AgentStatus::Inactive, AgentStatus::Active) => true,
            (AgentStatus::Inactive | AgentStatus::Active, s) if s.is_terminal() => true,
            (a, b) => a == b,
        };
        if !ok {
            return Err(DialogError::invariant(format!(
                "illegal transition {:?} -> {:?} on '{}'",
                node.status, status, node.path
            )));
        }
        node.status = status;
        Ok(())
    }

    pub fn bump_attempts(&mut self, id: NodeId) -> u32 {
        let node = &mut self.nodes[id.0];
        node.attempts += 1;
        node.attempts
    }

    /// RESET/REOPEN：子树状态回到 inactive，尝试次数清零；返回被重置的节点
    pub fn reset_subtree(&mut self, id: NodeId) -> Vec<NodeId> {
        let ids = self.subtree(id);
        for n in &ids {
            let node = &mut self.nodes[n.0];
            node.status = AgentStatus::Inactive;
            node.attempts = 0;
        }
        ids
    }

    /// 在 parent 下注入一个 grounding 叶子
    pub fn inject(&mut self, parent: NodeId, kind: AgentKind, role: GroundingRole) -> NodeId {
        let id = NodeId(self.nodes.len());
        let label = match &role {
            GroundingRole::ExplicitConfirm { .. } => "confirm",
            GroundingRole::ImplicitConfirm { .. } => "implicit_confirm",
            GroundingRole::Clarify { .. } => "clarify",
        };
        let name = format!("{}:{}#{}", label, role.concept(), id.0);
        let path = format!("{}/{}", self.nodes[parent.0].path, name);
        self.nodes.push(AgentNode {
            id,
            name,
            path,
            kind,
            parent: Some(parent),
            children: Vec::new(),
            precondition: None,
            trigger: None,
            success: None,
            failure: None,
            on_completion: Vec::new(),
            required: false,
            grounding: Some(role),
            status: AgentStatus::Inactive,
            attempts: 0,
        });
        id
    }

    /// 注入节点全部终止后回收 arena 尾部；返回是否回收
    pub fn compact_injected(&mut self) -> bool {
        let all_done = self.nodes[self.static_len..]
            .iter()
            .all(|n| n.status.is_terminal());
        if all_done && self.nodes.len() > self.static_len {
            self.nodes.truncate(self.static_len);
            true
        } else {
            false
        }
    }

    pub fn capture(&self) -> TreeState {
        TreeState {
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeState {
                    status: n.status,
                    attempts: n.attempts,
                })
                .collect(),
            injected: self.nodes[self.static_len..]
                .iter()
                .filter_map(|n| {
                    Some(InjectedNode {
                        parent: n.parent?,
                        kind: n.kind.clone(),
                        role: n.grounding.clone()?,
                    })
                })
                .collect(),
        }
    }

    /// 整体替换运行时状态（快照恢复）
    pub fn apply(&mut self, state: &TreeState) -> Result<(), DialogError> {
        if state.nodes.len() != self.static_len + state.injected.len() {
            return Err(DialogError::invariant("snapshot does not match this tree"));
        }
        self.nodes.truncate(self.static_len);
        for inj in &state.injected {
            self.inject(inj.parent, inj.kind.clone(), inj.role.clone());
        }
        for (node, s) in self.nodes.iter_mut().zip(&state.nodes) {
            node.status = s.status;
            node.attempts = s.attempts;
        }
        Ok(())
    }

    /// 检查树的结构不变量：唯一根、父子一致、无环、全部可达
    pub fn check_invariants(&self) -> Result<(), DialogError> {
        let roots: Vec<_> = self.nodes[..self.static_len]
            .iter()
            .filter(|n| n.parent.is_none())
            .collect();
        if roots.len() != 1 || roots[0].id != self.root {
            return Err(DialogError::invariant(format!(
                "tree must have exactly one root, found {}",
                roots.len()
            )));
        }

        let mut visited = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                return Err(DialogError::invariant(format!(
                    "cycle or shared child at '{}'",
                    self.nodes[id.0].path
                )));
            }
            for c in &self.nodes[id.0].children {
                if self.nodes[c.0].parent != Some(id) {
                    return Err(DialogError::invariant(format!(
                        "child '{}' does not point back to '{}'",
                        self.nodes[c.0].path, self.nodes[id.0].path
                    )));
                }
                stack.push(*c);
            }
        }
        if visited.len() != self.static_len {
            return Err(DialogError::invariant("unreachable agents in tree"));
        }

        for n in &self.nodes[self.static_len..] {
            match n.parent {
                Some(p) if p.0 < self.static_len && self.nodes[p.0].kind.is_agency() => {}
                _ => {
                    return Err(DialogError::invariant(format!(
                        "injected node '{}' has no agency parent",
                        n.path
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtt::{AgentTemplate, Predicate, ScriptAction, TemplateBuilder};

    fn navi_template() -> TaskTemplate {
        TemplateBuilder::new("navi")
            .root(
                AgentTemplate::agency("Navi")
                    .concept("poi", ConceptType::String)
                    .concept("results", ConceptType::FrameArray)
                    .concept("destination", ConceptType::Frame)
                    .child(
                        AgentTemplate::agency("SearchPoi")
                            .success(Predicate::available("destination"))
                            .child(AgentTemplate::request("RequestPoi", "poi", "ask_poi"))
                            .child(AgentTemplate::execute("DoSearch", "search_poi", &["poi"], "results")),
                    )
                    .child(
                        AgentTemplate::inform("BeginNavi", "begin_navi")
                            .precondition(Predicate::available("destination"))
                            .on_completion(ScriptAction::continue_with("SearchPoi")),
                    ),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_instantiate_arena_layout() {
        let mut concepts = ConceptStore::new();
        let tree = DialogAgentTree::instantiate(&navi_template(), &mut concepts).unwrap();
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.find("/Navi/SearchPoi/DoSearch"), Some(NodeId(3)));
        assert_eq!(tree.node(NodeId(1)).children, vec![NodeId(2), NodeId(3)]);
        assert_eq!(tree.ancestors(NodeId(3)), vec![NodeId(0), NodeId(1)]);
        assert!(concepts.contains(CONFIRM_CONCEPT));
        assert_eq!(concepts.get("poi").unwrap().scope, "/Navi");
        assert!(tree.check_invariants().is_ok());
    }

    #[test]
    fn test_relative_resolution() {
        let mut concepts = ConceptStore::new();
        let tree = DialogAgentTree::instantiate(&navi_template(), &mut concepts).unwrap();
        let begin = tree.find("/Navi/BeginNavi").unwrap();
        assert_eq!(tree.resolve_from(begin, "SearchPoi"), Some(NodeId(1)));
        assert_eq!(tree.resolve_from(begin, "Navi"), Some(NodeId(0)));
        assert_eq!(tree.resolve_from(begin, "DoSearch"), Some(NodeId(3)));
        assert_eq!(tree.resolve_from(begin, "Nope"), None);
    }

    #[test]
    fn test_undeclared_request_concept_is_configuration_error() {
        let template = TemplateBuilder::new("bad")
            .root(AgentTemplate::agency("Main").child(AgentTemplate::request("Ask", "x", "ask_x")))
            .build()
            .unwrap();
        let mut concepts = ConceptStore::new();
        assert!(matches!(
            DialogAgentTree::instantiate(&template, &mut concepts),
            Err(DialogError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_concept_scope_is_invariant_violation() {
        let template = TemplateBuilder::new("dup")
            .root(
                AgentTemplate::agency("Main")
                    .concept("x", ConceptType::String)
                    .child(
                        AgentTemplate::agency("Inner")
                            .concept("x", ConceptType::String)
                            .child(AgentTemplate::expect("Wait", "x")),
                    ),
            )
            .build()
            .unwrap();
        let mut concepts = ConceptStore::new();
        assert!(matches!(
            DialogAgentTree::instantiate(&template, &mut concepts),
            Err(DialogError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_continue_with_must_be_sibling_or_ancestor() {
        let template = TemplateBuilder::new("jump")
            .root(
                AgentTemplate::agency("Main")
                    .concept("x", ConceptType::String)
                    .child(
                        AgentTemplate::agency("A")
                            .child(AgentTemplate::expect("Deep", "x")),
                    )
                    .child(
                        AgentTemplate::inform("B", "b")
                            .on_completion(ScriptAction::continue_with("Deep")),
                    ),
            )
            .build()
            .unwrap();
        let mut concepts = ConceptStore::new();
        assert!(matches!(
            DialogAgentTree::instantiate(&template, &mut concepts),
            Err(DialogError::Configuration(_))
        ));
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let mut concepts = ConceptStore::new();
        let mut tree = DialogAgentTree::instantiate(&navi_template(), &mut concepts).unwrap();
        let id = NodeId(2);
        tree.set_status(id, AgentStatus::Active).unwrap();
        tree.set_status(id, AgentStatus::Completed).unwrap();
        assert!(tree.set_status(id, AgentStatus::Active).is_err());
        assert!(tree.set_status(id, AgentStatus::Failed).is_err());
        tree.reset_subtree(id);
        assert_eq!(tree.status(id), AgentStatus::Inactive);
    }

    #[test]
    fn test_inject_capture_apply() {
        let mut concepts = ConceptStore::new();
        let mut tree = DialogAgentTree::instantiate(&navi_template(), &mut concepts).unwrap();
        tree.set_status(NodeId(0), AgentStatus::Active).unwrap();
        let before = tree.capture();

        let role = GroundingRole::Clarify {
            concept: "poi".into(),
        };
        let kind = AgentKind::Inform {
            prompt: "clarify".into(),
            fillers: vec![],
            interruptable: true,
        };
        let inj = tree.inject(NodeId(0), kind, role);
        assert_eq!(inj, NodeId(5));
        assert!(tree.check_invariants().is_ok());
        assert!(!tree.compact_injected());
        let with_injected = tree.capture();
        assert_eq!(with_injected.injected.len(), 1);

        tree.set_status(inj, AgentStatus::Completed).unwrap();
        assert!(tree.compact_injected());
        assert_eq!(tree.len(), 5);

        tree.apply(&with_injected).unwrap();
        assert_eq!(tree.len(), 6);
        assert_eq!(tree.status(inj), AgentStatus::Inactive);
        tree.apply(&before).unwrap();
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.status(NodeId(0)), AgentStatus::Active);
    }
}
