use crate::queue::QueueItem;
use crate::quota_pool::Usage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// 池的实时预留状态：已放行但尚未计入指标的在途请求总量。
///
/// 只存在于进程内存，重启后为空。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolWorkloadAllocation {
    pub pool_id: String,
    pub total: Usage,
    pub by_resource: BTreeMap<String, Usage>,
}

impl PoolWorkloadAllocation {
    pub fn new(pool_id: &str) -> Self {
        Self {
            pool_id: pool_id.to_string(),
            ..Self::default()
        }
    }

    pub fn resource(&self, resource_id: &str) -> Usage {
        self.by_resource
            .get(resource_id)
            .copied()
            .unwrap_or_default()
    }

    /// 返回叠加一次预留后的副本，不修改自身。
    pub fn with_reserved(&self, resource_id: &str, amount: Usage) -> Self {
        let mut next = self.clone();
        next.add(resource_id, amount);
        next
    }

    pub(crate) fn add(&mut self, resource_id: &str, amount: Usage) {
        self.total = self.total.saturating_add(amount);
        let slot = self.by_resource.entry(resource_id.to_string()).or_default();
        *slot = slot.saturating_add(amount);
    }

    /// 扣减预留，在零处截断。
    pub(crate) fn sub(&mut self, resource_id: &str, amount: Usage) {
        if let Some(slot) = self.by_resource.get_mut(resource_id) {
            let removed = Usage {
                requests: amount.requests.min(slot.requests),
                tokens: amount.tokens.min(slot.tokens),
            };
            *slot = slot.saturating_sub(removed);
            self.total = self.total.saturating_sub(removed);
            if slot.is_zero() {
                self.by_resource.remove(resource_id);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total.is_zero() && self.by_resource.is_empty()
    }
}

/// 放行时返回给调用方的凭据，完成回报时原样带回。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationTicket {
    pub id: Uuid,
    pub pool_id: String,
    pub resource_id: String,
}

/// 待提交的一次预留。
#[derive(Debug, Clone)]
pub struct Hold {
    pub resource_id: String,
    pub connection_id: String,
    pub amount: Usage,
    pub request_time: DateTime<Utc>,
    /// 被放行的 item，随预留一起存活，瞬时失败时据此重新排队。
    pub item: Option<QueueItem>,
}

/// 一条在途预留记录。
#[derive(Debug, Clone)]
pub struct InFlight {
    pub ticket: ReservationTicket,
    pub connection_id: String,
    pub amount: Usage,
    pub request_time: DateTime<Utc>,
    pub created_at: Instant,
    pub item: Option<QueueItem>,
}

/// 超过最长在途时长、被清扫强制释放的预留。
#[derive(Debug, Clone)]
pub struct LeakedReservation {
    pub reservation: InFlight,
    pub age: Duration,
}
