//! 后端接口抽象
//!
//! Execute 节点通过 Backend::call 调用外部业务逻辑（搜索、拨号、播放……），
//! 返回输出绑定或错误原因。实现方自行决定传输方式。

pub mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::concept::{ConceptValue, ProposedBinding};

pub use mock::MockBackend;

/// 后端 trait：按名字调用，输入为当前可用的概念值
#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(
        &self,
        name: &str,
        inputs: &BTreeMap<String, ConceptValue>,
    ) -> Result<Vec<ProposedBinding>, String>;
}
