//! 任务调度：后端调用池与计时器
//!
//! 后端调用使用 Semaphore 限制并发并受 `backend_timeout` 约束；结果与超时都以
//! InteractionEvent 的形式发回所属会话的事件通道。所有任务都响应取消令牌。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::SessionConfig;
use crate::core::DispatchedCall;
use crate::dtt::NodeId;
use crate::interaction::{BackendOutcome, InteractionEvent};

/// 任务调度器（宿主内所有会话共享）
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    backend_semaphore: Arc<Semaphore>,
    backend_timeout: Duration,
}

impl TaskScheduler {
    pub fn new(max_concurrent_calls: usize, backend_timeout: Duration) -> Self {
        Self {
            backend_semaphore: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            backend_timeout,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.max_concurrent_backend_calls,
            Duration::from_secs(config.backend_timeout_secs),
        )
    }

    /// 当前可用的调用许可数
    pub fn available_permits(&self) -> usize {
        self.backend_semaphore.available_permits()
    }

    /// 异步执行一次后端调用；超时视为错误，被取消时不发回任何事件
    pub fn spawn_backend_call(
        &self,
        backend: Arc<dyn Backend>,
        call: DispatchedCall,
        token: CancellationToken,
        tx: mpsc::UnboundedSender<InteractionEvent>,
    ) -> JoinHandle<()> {
        let semaphore = self.backend_semaphore.clone();
        let limit = self.backend_timeout;
        tokio::spawn(async move {
            let _permit = tokio::select! {
                _ = token.cancelled() => return,
                permit = semaphore.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };
            let result = tokio::select! {
                _ = token.cancelled() => {
                    debug!(node = %call.node, call = %call.call, "Backend call cancelled");
                    return;
                }
                r = tokio::time::timeout(limit, backend.call(&call.call, &call.inputs)) => match r {
                    Ok(r) => r,
                    Err(_) => {
                        warn!(call = %call.call, secs = limit.as_secs_f64(), "Backend call timed out");
                        Err(format!("timed out after {:?}", limit))
                    }
                },
            };
            let event = InteractionEvent::BackendResult {
                node: call.node,
                call_id: call.call_id,
                outcome: BackendOutcome::from(result),
            };
            if tx.send(event).is_err() {
                debug!(call = %call.call, "Session gone before backend result");
            }
        })
    }

    /// 启动一个计时器，到期后投递 Timeout 事件
    pub fn spawn_timer(
        &self,
        node: NodeId,
        generation: u64,
        after: Duration,
        token: CancellationToken,
        tx: mpsc::UnboundedSender<InteractionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    tx.send(InteractionEvent::Timeout { node, generation }).ok();
                }
            }
        })
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::backend::MockBackend;
    use crate::concept::ProposedBinding;

    fn call(name: &str) -> DispatchedCall {
        DispatchedCall {
            node: NodeId(4),
            call_id: 1,
            call: name.to_string(),
            inputs: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_backend_result_posted_as_event() {
        let scheduler = TaskScheduler::new(2, Duration::from_secs(5));
        let backend = Arc::new(
            MockBackend::new().on("count", |_| Ok(vec![ProposedBinding::new("n", 2i64, 1.0)])),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler
            .spawn_backend_call(backend, call("count"), CancellationToken::new(), tx)
            .await
            .unwrap();
        match rx.recv().await {
            Some(InteractionEvent::BackendResult { node, call_id, outcome }) => {
                assert_eq!(node, NodeId(4));
                assert_eq!(call_id, 1);
                assert!(matches!(outcome, BackendOutcome::Result { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hung_backend_becomes_error() {
        let scheduler = TaskScheduler::new(1, Duration::from_millis(20));
        struct Hang;
        #[async_trait::async_trait]
        impl Backend for Hang {
            async fn call(
                &self,
                _name: &str,
                _inputs: &BTreeMap<String, crate::concept::ConceptValue>,
            ) -> Result<Vec<ProposedBinding>, String> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(vec![])
            }
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler
            .spawn_backend_call(Arc::new(Hang), call("hang"), CancellationToken::new(), tx)
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(InteractionEvent::BackendResult {
                outcome: BackendOutcome::Error { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_timer_stays_silent() {
        let scheduler = TaskScheduler::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let fired = scheduler.spawn_timer(NodeId(1), 3, Duration::from_millis(10), token, tx.clone());
        let quiet = CancellationToken::new();
        let silent = scheduler.spawn_timer(NodeId(2), 4, Duration::from_secs(60), quiet.clone(), tx);
        quiet.cancel();
        fired.await.unwrap();
        silent.await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(InteractionEvent::Timeout { node: NodeId(1), generation: 3 })
        );
        assert!(rx.try_recv().is_err());
    }
}
