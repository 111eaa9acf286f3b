//! Mock 后端（测试与控制台使用）
//!
//! 按调用名注册处理函数，或从 JSON 夹具文件加载固定的返回。

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::Backend;
use crate::concept::{ConceptValue, ProposedBinding};
use crate::core::DialogError;
use crate::interaction::BackendOutcome;

type Handler =
    Arc<dyn Fn(&BTreeMap<String, ConceptValue>) -> Result<Vec<ProposedBinding>, String> + Send + Sync>;

/// Mock 后端：记录每次调用，按注册的处理函数返回
#[derive(Default, Clone)]
pub struct MockBackend {
    handlers: HashMap<String, Handler>,
    log: Arc<Mutex<Vec<(String, BTreeMap<String, ConceptValue>)>>>,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("calls", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理函数
    pub fn on<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&BTreeMap<String, ConceptValue>) -> Result<Vec<ProposedBinding>, String>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// 注册固定返回
    pub fn returning(self, name: impl Into<String>, outcome: BackendOutcome) -> Self {
        self.on(name, move |_| outcome.clone().into_result())
    }

    /// 夹具格式：`{"search_poi": {"result": {"bindings": [...]}}, "dial": {"error": {"reason": "busy"}}}`
    pub fn from_fixtures(path: impl AsRef<Path>) -> Result<Self, DialogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DialogError::config(format!("cannot read fixtures {}: {}", path.display(), e))
        })?;
        let fixtures: BTreeMap<String, BackendOutcome> = serde_json::from_str(&content)
            .map_err(|e| DialogError::config(format!("invalid fixtures {}: {}", path.display(), e)))?;
        Ok(fixtures
            .into_iter()
            .fold(Self::new(), |backend, (name, outcome)| backend.returning(name, outcome)))
    }

    /// 已发生的调用（按顺序）
    pub fn calls(&self) -> Vec<(String, BTreeMap<String, ConceptValue>)> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn call(
        &self,
        name: &str,
        inputs: &BTreeMap<String, ConceptValue>,
    ) -> Result<Vec<ProposedBinding>, String> {
        if let Ok(mut log) = self.log.lock() {
            log.push((name.to_string(), inputs.clone()));
        }
        match self.handlers.get(name) {
            Some(handler) => handler(inputs),
            None => Err(format!("no mock registered for '{}'", name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_sees_inputs() {
        let backend = MockBackend::new().on("echo", |inputs| {
            let q = inputs.get("q").cloned().ok_or("missing q")?;
            Ok(vec![ProposedBinding::new("out", q, 1.0)])
        });
        let mut inputs = BTreeMap::new();
        inputs.insert("q".to_string(), ConceptValue::from("bank"));
        let out = backend.call("echo", &inputs).await.unwrap();
        assert_eq!(out[0].value, ConceptValue::from("bank"));
        assert!(backend.call("nope", &inputs).await.is_err());
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_from_fixtures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixtures.json");
        std::fs::write(
            &path,
            r#"{"dial": {"error": {"reason": "busy"}},
                "lookup": {"result": {"bindings": [{"concept": "n", "value": 3}]}}}"#,
        )
        .unwrap();
        let backend = MockBackend::from_fixtures(&path).unwrap();
        let none = BTreeMap::new();
        assert_eq!(backend.call("dial", &none).await, Err("busy".to_string()));
        let out = backend.call("lookup", &none).await.unwrap();
        assert_eq!(out[0].value, ConceptValue::Int(3));
        assert_eq!(out[0].confidence, 1.0);
    }
}
