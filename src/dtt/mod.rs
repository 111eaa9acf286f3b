//! Dialog Task Tree
//!
//! 模板（纯数据）→ 实例化的 agent 树（arena）→ 调度器按焦点栈逐轮执行

pub mod builder;
pub mod engine;
pub mod focus;
pub mod predicate;
pub mod script;
pub mod template;
pub mod tree;
pub mod types;

pub use builder::TemplateBuilder;
pub use engine::{
    BackendRequest, ConceptHistory, CycleOutcome, DialogContext, DttManager, EngineSettings,
    EngineState, NoHistory, Selection, TimerRequest,
};
pub use focus::FocusStack;
pub use predicate::{Condition, ConditionScope, Predicate};
pub use script::{CompletionAction, RestoreSource, ScriptAction, ValueSource};
pub use template::{AgentTemplate, ConceptDecl, TaskTemplate};
pub use tree::{AgentNode, DialogAgentTree, InjectedNode, NodeState, TreeState};
pub use types::{
    AgentKind, AgentStatus, GroundingRole, NodeId, TimeoutPolicy, CONFIRM_CONCEPT, SYSTEM_SCOPE,
};
