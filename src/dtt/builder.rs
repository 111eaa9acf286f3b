//! 模板构建器
//!
//! 提供流畅的API来在代码中构建任务模板（测试与嵌入式宿主使用）

use super::predicate::Predicate;
use super::script::ScriptAction;
use super::template::{AgentTemplate, ConceptDecl, TaskTemplate};
use super::types::{AgentKind, TimeoutPolicy};
use crate::concept::{ConceptType, ConceptValue};
use crate::core::DialogError;
use crate::grounding::GroundingOverride;

impl AgentTemplate {
    fn with_kind(name: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            concepts: Vec::new(),
            precondition: None,
            trigger: None,
            success: None,
            failure: None,
            on_completion: Vec::new(),
            required: true,
            children: Vec::new(),
        }
    }

    /// 组合节点
    pub fn agency(name: impl Into<String>) -> Self {
        Self::with_kind(name, AgentKind::Agency)
    }

    /// 请求节点
    pub fn request(
        name: impl Into<String>,
        concept: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            AgentKind::Request {
                concept: concept.into(),
                prompt: prompt.into(),
                fillers: Vec::new(),
                timeout_secs: None,
                max_attempts: None,
                on_timeout: TimeoutPolicy::Reprompt,
            },
        )
    }

    /// 通知节点
    pub fn inform(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            AgentKind::Inform {
                prompt: prompt.into(),
                fillers: Vec::new(),
                interruptable: true,
            },
        )
    }

    /// 后端调用节点
    pub fn execute(
        name: impl Into<String>,
        call: impl Into<String>,
        inputs: &[&str],
        output: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            AgentKind::Execute {
                call: call.into(),
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                output: output.into(),
            },
        )
    }

    /// 被动等待节点
    pub fn expect(name: impl Into<String>, concept: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            AgentKind::Expect {
                concept: concept.into(),
            },
        )
    }

    /// 添加子节点
    pub fn child(mut self, child: AgentTemplate) -> Self {
        self.children.push(child);
        self
    }

    /// 在本节点作用域声明概念
    pub fn concept(mut self, name: impl Into<String>, ty: ConceptType) -> Self {
        self.concepts.push(ConceptDecl {
            name: name.into(),
            ty,
            default: None,
            grounding: None,
        });
        self
    }

    /// 声明带初始值的概念
    pub fn concept_with_default(
        mut self,
        name: impl Into<String>,
        ty: ConceptType,
        default: ConceptValue,
    ) -> Self {
        self.concepts.push(ConceptDecl {
            name: name.into(),
            ty,
            default: Some(default),
            grounding: None,
        });
        self
    }

    /// 为最近声明的概念设置 grounding 覆盖
    pub fn grounding(mut self, overrides: GroundingOverride) -> Self {
        if let Some(last) = self.concepts.last_mut() {
            last.grounding = Some(overrides);
        }
        self
    }

    pub fn precondition(mut self, p: Predicate) -> Self {
        self.precondition = Some(p);
        self
    }

    pub fn trigger(mut self, p: Predicate) -> Self {
        self.trigger = Some(p);
        self
    }

    pub fn success(mut self, p: Predicate) -> Self {
        self.success = Some(p);
        self
    }

    pub fn failure(mut self, p: Predicate) -> Self {
        self.failure = Some(p);
        self
    }

    /// 追加完成脚本动作
    pub fn on_completion(mut self, action: ScriptAction) -> Self {
        self.on_completion.push(action);
        self
    }

    /// 不计入父 Agency 的默认规则
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// 设置输出填充的概念（Request / Inform）
    pub fn fillers(mut self, names: &[&str]) -> Self {
        if let AgentKind::Request { fillers, .. } | AgentKind::Inform { fillers, .. } =
            &mut self.kind
        {
            *fillers = names.iter().map(|s| s.to_string()).collect();
        }
        self
    }

    /// Inform 执行期间不可被焦点重定向抢占
    pub fn non_interruptable(mut self) -> Self {
        if let AgentKind::Inform { interruptable, .. } = &mut self.kind {
            *interruptable = false;
        }
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        if let AgentKind::Request { timeout_secs, .. } = &mut self.kind {
            *timeout_secs = Some(secs);
        }
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        if let AgentKind::Request { max_attempts, .. } = &mut self.kind {
            *max_attempts = Some(n);
        }
        self
    }

    pub fn on_timeout(mut self, policy: TimeoutPolicy) -> Self {
        if let AgentKind::Request { on_timeout, .. } = &mut self.kind {
            *on_timeout = policy;
        }
        self
    }
}

/// 任务模板构建器
pub struct TemplateBuilder {
    name: String,
    description: Option<String>,
    root: Option<AgentTemplate>,
}

impl TemplateBuilder {
    /// 创建新的模板构建器
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            root: None,
        }
    }

    /// 设置描述
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// 设置根 Agency
    pub fn root(mut self, root: AgentTemplate) -> Self {
        self.root = Some(root);
        self
    }

    /// 构建并校验模板
    pub fn build(self) -> Result<TaskTemplate, DialogError> {
        let root = self
            .root
            .ok_or_else(|| DialogError::config("template root is required"))?;
        let template = TaskTemplate {
            name: self.name,
            description: self.description,
            root,
        };
        template.validate()?;
        Ok(template)
    }
}
