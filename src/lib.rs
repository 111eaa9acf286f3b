//! DTT - 基于 Dialog Task Tree 的多轮口语对话控制器
//!
//! 模块划分：
//! - **concept**: 概念取值、类型与概念存储（绑定历史、grounding 状态）
//! - **dtt**: 任务模板、agent 树、焦点栈与调度器（DTTManager）
//! - **grounding**: 置信度分档、显式/隐式确认与澄清
//! - **interaction**: 交互事件与会话事件队列
//! - **output**: 每轮至多一个面向用户的输出
//! - **backend**: Execute 节点调用的后端接口与 Mock 实现
//! - **core**: 错误与恢复、状态快照、会话监管、任务调度、DMCore 主控循环
//! - **gateway**: 多会话宿主（StartSession / PostEvent / PollOutput / AbortSession）
//! - **config**: 应用配置加载（TOML + 环境变量）

pub mod backend;
pub mod concept;
pub mod config;
pub mod core;
pub mod dtt;
pub mod gateway;
pub mod grounding;
pub mod interaction;
pub mod observability;
pub mod output;

pub use crate::core::{DialogError, DialogSession, SessionStatus, TurnReport};
pub use crate::dtt::TaskTemplate;
pub use crate::gateway::SessionHost;
