//! 静态任务模板
//!
//! 会话启动时一次性加载的纯数据文档（JSON 或 TOML），描述节点类型、概念、谓词与完成脚本。
//! 引擎从不修改模板；同一模板可被多个会话共享（`Arc<TaskTemplate>`）。

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::predicate::Predicate;
use super::script::ScriptAction;
use super::types::{AgentKind, CONFIRM_CONCEPT};
use crate::concept::{ConceptType, ConceptValue};
use crate::core::DialogError;
use crate::grounding::GroundingOverride;

/// 概念声明（作用域为声明它的 agent 路径）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ConceptType,
    /// 初始值，以 available 状态绑定
    #[serde(default)]
    pub default: Option<ConceptValue>,
    /// 该概念的 grounding 阈值覆盖
    #[serde(default)]
    pub grounding: Option<GroundingOverride>,
}

fn default_required() -> bool {
    true
}

/// 模板中的一个 agent 节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTemplate {
    pub name: String,
    #[serde(flatten)]
    pub kind: AgentKind,
    #[serde(default)]
    pub concepts: Vec<ConceptDecl>,
    #[serde(default)]
    pub precondition: Option<Predicate>,
    #[serde(default)]
    pub trigger: Option<Predicate>,
    #[serde(default)]
    pub success: Option<Predicate>,
    #[serde(default)]
    pub failure: Option<Predicate>,
    #[serde(default)]
    pub on_completion: Vec<ScriptAction>,
    /// 不计入父 Agency 默认成功/失败规则时为 false
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub children: Vec<AgentTemplate>,
}

/// 任务模板根
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub root: AgentTemplate,
}

impl TaskTemplate {
    pub fn from_json_str(s: &str) -> Result<Self, DialogError> {
        let template: TaskTemplate = serde_json::from_str(s)
            .map_err(|e| DialogError::config(format!("invalid JSON template: {}", e)))?;
        template.validate()?;
        Ok(template)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, DialogError> {
        let template: TaskTemplate = toml::from_str(s)
            .map_err(|e| DialogError::config(format!("invalid TOML template: {}", e)))?;
        template.validate()?;
        Ok(template)
    }

    /// 按扩展名选择格式加载（.json / .toml）
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DialogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DialogError::config(format!("cannot read template {}: {}", path.display(), e))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            _ => Err(DialogError::config(format!(
                "unsupported template format: {}",
                path.display()
            ))),
        }
    }

    /// 结构校验；引用解析在实例化为树时完成
    pub fn validate(&self) -> Result<(), DialogError> {
        if self.name.trim().is_empty() {
            return Err(DialogError::config("template name is empty"));
        }
        if !self.root.kind.is_agency() {
            return Err(DialogError::config("template root must be an agency"));
        }
        validate_agent(&self.root, "")
    }

    /// 模板中所有节点数（含根）
    pub fn node_count(&self) -> usize {
        fn count(a: &AgentTemplate) -> usize {
            1 + a.children.iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }
}

fn validate_agent(agent: &AgentTemplate, parent_path: &str) -> Result<(), DialogError> {
    let path = format!("{}/{}", parent_path, agent.name);
    if agent.name.trim().is_empty() || agent.name.contains('/') {
        return Err(DialogError::config(format!(
            "invalid agent name '{}' under '{}'",
            agent.name, parent_path
        )));
    }

    match agent.kind {
        AgentKind::Agency => {
            if agent.children.is_empty() {
                return Err(DialogError::config(format!(
                    "agency '{}' has no subagents",
                    path
                )));
            }
        }
        _ => {
            if !agent.children.is_empty() {
                return Err(DialogError::config(format!(
                    "{} '{}' cannot own subagents",
                    agent.kind.label(),
                    path
                )));
            }
        }
    }

    for decl in &agent.concepts {
        if decl.name.trim().is_empty() {
            return Err(DialogError::config(format!("empty concept name in '{}'", path)));
        }
        if decl.name == CONFIRM_CONCEPT {
            return Err(DialogError::config(format!(
                "concept name '{}' is reserved ('{}')",
                CONFIRM_CONCEPT, path
            )));
        }
        if let Some(g) = &decl.grounding {
            g.validate()
                .map_err(|e| DialogError::config(format!("concept '{}': {}", decl.name, e)))?;
        }
    }

    let mut seen = HashSet::new();
    for child in &agent.children {
        if !seen.insert(child.name.as_str()) {
            return Err(DialogError::config(format!(
                "duplicate subagent '{}' in '{}'",
                child.name, path
            )));
        }
        validate_agent(child, &path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAVI_JSON: &str = r#"{
        "name": "navi",
        "root": {
            "name": "Navi",
            "kind": "agency",
            "concepts": [
                {"name": "poi", "type": "string"},
                {"name": "results", "type": "frame_array"}
            ],
            "children": [
                {"name": "RequestPoi", "kind": "request", "concept": "poi", "prompt": "ask_poi"},
                {"name": "SearchPoi", "kind": "execute", "call": "search_poi",
                 "inputs": ["poi"], "output": "results"}
            ]
        }
    }"#;

    #[test]
    fn test_load_json_template() {
        let t = TaskTemplate::from_json_str(NAVI_JSON).unwrap();
        assert_eq!(t.name, "navi");
        assert_eq!(t.node_count(), 3);
        assert!(t.root.children[0].required);
        assert!(matches!(t.root.children[1].kind, AgentKind::Execute { .. }));
    }

    #[test]
    fn test_load_toml_template() {
        let toml_src = r#"
            name = "menu"

            [root]
            name = "Main"
            kind = "agency"

            [[root.concepts]]
            name = "item"
            type = "string"

            [[root.children]]
            name = "AskItem"
            kind = "request"
            concept = "item"
            prompt = "ask_item"
            max_attempts = 2
        "#;
        let t = TaskTemplate::from_toml_str(toml_src).unwrap();
        assert!(matches!(
            t.root.children[0].kind,
            AgentKind::Request { max_attempts: Some(2), .. }
        ));
    }

    #[test]
    fn test_leaf_with_children_rejected() {
        let bad = NAVI_JSON.replace(
            r#""prompt": "ask_poi"}"#,
            r#""prompt": "ask_poi", "children": [{"name": "X", "kind": "expect", "concept": "poi"}]}"#,
        );
        assert!(matches!(
            TaskTemplate::from_json_str(&bad),
            Err(DialogError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_sibling_rejected() {
        let bad = NAVI_JSON.replace("\"SearchPoi\"", "\"RequestPoi\"");
        assert!(TaskTemplate::from_json_str(&bad).is_err());
    }

    #[test]
    fn test_reserved_confirm_concept_rejected() {
        let bad = NAVI_JSON.replace(r#""name": "poi", "type""#, r#""name": "confirm", "type""#);
        assert!(TaskTemplate::from_json_str(&bad).is_err());
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("navi.json");
        std::fs::write(&path, NAVI_JSON).unwrap();
        assert!(TaskTemplate::load(&path).is_ok());
        let other = dir.path().join("navi.yaml");
        std::fs::write(&other, NAVI_JSON).unwrap();
        assert!(TaskTemplate::load(&other).is_err());
    }
}
