use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 优先级类别。排序即出队顺序：Interactive 先于 Batch。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Interactive,
    #[default]
    Batch,
}

impl Priority {
    pub const ALL: [Priority; 2] = [Priority::Interactive, Priority::Batch];
}

/// 一次准入请求的判定参数。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRequest {
    pub pool_id: String,
    /// 不指定时由编排器按余量挑选条目。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub request_tokens: u64,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// 已重新尝试的次数；只增不减，不超过配置的上限。
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<String>,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// 只在进程内流转，不写入死信日志。
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl fmt::Debug for ItemContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemContext")
            .field("batch_id", &self.batch_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// 延迟处理的工作单元：原始请求 + 重试元数据 + 上下文。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub request: GateRequest,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub metadata: ItemMetadata,
    #[serde(default)]
    pub context: ItemContext,
}

impl QueueItem {
    pub fn new(request: GateRequest, payload: serde_json::Value, context: ItemContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            payload,
            metadata: ItemMetadata {
                retry_count: 0,
                created_at: Utc::now(),
                last_reason: None,
            },
            context,
        }
    }
}

/// 重试耗尽（或不可能满足）的终态记录。
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub item: QueueItem,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}
