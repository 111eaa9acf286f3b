//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DTT__*` 覆盖（双下划线表示嵌套，如 `DTT__GROUNDING__ACCEPT_THRESHOLD=0.8`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::concept::ConceptType;
use crate::core::DialogError;
use crate::grounding::{ConfirmationMode, GroundingOverride, Thresholds};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub grounding: GroundingConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// [app] 段：应用名、任务模板目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 启动时加载其中的 .json / .toml 模板，未设置时用 ./templates
    pub template_dir: Option<PathBuf>,
}

/// [grounding] 段：置信度阈值与确认策略
#[derive(Debug, Clone, Deserialize)]
pub struct GroundingConfig {
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f32,
    #[serde(default = "default_reject_threshold")]
    pub reject_threshold: f32,
    #[serde(default)]
    pub confirmation: ConfirmationMode,
    #[serde(default = "default_max_confirm_attempts")]
    pub max_confirm_attempts: u32,
    /// 丢弃不在期望集合中的用户绑定
    #[serde(default)]
    pub strict_expectations: bool,
    /// [grounding.types.<type>] 按概念类型覆盖
    #[serde(default)]
    pub types: HashMap<String, GroundingOverride>,
}

fn default_accept_threshold() -> f32 {
    0.75
}

fn default_reject_threshold() -> f32 {
    0.35
}

fn default_max_confirm_attempts() -> u32 {
    2
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            accept_threshold: default_accept_threshold(),
            reject_threshold: default_reject_threshold(),
            confirmation: ConfirmationMode::default(),
            max_confirm_attempts: default_max_confirm_attempts(),
            strict_expectations: false,
            types: HashMap::new(),
        }
    }
}

impl GroundingConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            accept: self.accept_threshold,
            reject: self.reject_threshold,
            confirmation: self.confirmation,
        }
    }

    /// 把 [grounding.types] 的键解析为概念类型
    pub fn type_overrides(&self) -> Result<HashMap<ConceptType, GroundingOverride>, DialogError> {
        self.types
            .iter()
            .map(|(name, o)| {
                let ty: ConceptType =
                    serde_json::from_value(serde_json::Value::String(name.clone())).map_err(
                        |_| DialogError::config(format!("grounding.types: unknown type '{}'", name)),
                    )?;
                Ok((ty, *o))
            })
            .collect()
    }
}

/// [session] 段：计时、尝试次数与资源上限
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Request 等待输入的秒数，0 表示不计时
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 单个事件内调度步数上限，超过视为不变量破坏
    #[serde(default = "default_max_steps_per_turn")]
    pub max_steps_per_turn: usize,
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// Inform 之后自动追加 Resume 事件
    #[serde(default = "default_true")]
    pub auto_resume_after_inform: bool,
    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_backend_calls")]
    pub max_concurrent_backend_calls: usize,
}

fn default_request_timeout_secs() -> u64 {
    8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_steps_per_turn() -> usize {
    64
}

fn default_max_snapshots() -> usize {
    32
}

fn default_true() -> bool {
    true
}

fn default_backend_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_backend_calls() -> usize {
    4
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            max_steps_per_turn: default_max_steps_per_turn(),
            max_snapshots: default_max_snapshots(),
            auto_resume_after_inform: true,
            backend_timeout_secs: default_backend_timeout_secs(),
            max_concurrent_backend_calls: default_max_concurrent_backend_calls(),
        }
    }
}

impl AppConfig {
    /// 阈值越界或顺序颠倒视为配置错误
    pub fn validate(&self) -> Result<(), DialogError> {
        self.grounding
            .thresholds()
            .validate()
            .map_err(|e| DialogError::config(format!("grounding: {}", e)))?;
        let base = self.grounding.thresholds();
        for (ty, o) in self.grounding.type_overrides()? {
            o.apply(base)
                .validate()
                .map_err(|e| DialogError::config(format!("grounding.types.{}: {}", ty, e)))?;
        }
        if self.session.max_steps_per_turn == 0 {
            return Err(DialogError::config("session.max_steps_per_turn must be positive"));
        }
        if self.session.max_concurrent_backend_calls == 0 {
            return Err(DialogError::config(
                "session.max_concurrent_backend_calls must be positive",
            ));
        }
        Ok(())
    }

    pub fn template_dir(&self) -> PathBuf {
        self.app
            .template_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("templates"))
    }
}

/// 从 config 目录加载配置，环境变量 DTT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DTT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DTT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
