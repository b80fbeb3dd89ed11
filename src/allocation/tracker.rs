//! 预留跟踪器：核心中唯一的共享可变状态。
//!
//! 按 poolId 哈希到分片，每个分片一把锁；不同池的操作完全并行。
//! 池级规则需要池内所有条目的预留之和，所以判定与提交在同一分片锁内完成。

use crate::allocation::types::{
    Hold, InFlight, LeakedReservation, PoolWorkloadAllocation, ReservationTicket,
};
use crate::quota_pool::Usage;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const DEFAULT_SHARDS: usize = 32;

#[derive(Debug, Default)]
struct Shard {
    pools: HashMap<String, PoolWorkloadAllocation>,
    in_flight: HashMap<Uuid, InFlight>,
}

impl Shard {
    fn allocation(&self, pool_id: &str) -> PoolWorkloadAllocation {
        self.pools
            .get(pool_id)
            .cloned()
            .unwrap_or_else(|| PoolWorkloadAllocation::new(pool_id))
    }

    fn add(&mut self, pool_id: &str, resource_id: &str, amount: Usage) -> PoolWorkloadAllocation {
        let alloc = self
            .pools
            .entry(pool_id.to_string())
            .or_insert_with(|| PoolWorkloadAllocation::new(pool_id));
        alloc.add(resource_id, amount);
        alloc.clone()
    }

    fn sub(&mut self, pool_id: &str, resource_id: &str, amount: Usage) -> PoolWorkloadAllocation {
        let Some(alloc) = self.pools.get_mut(pool_id) else {
            return PoolWorkloadAllocation::new(pool_id);
        };
        alloc.sub(resource_id, amount);
        let snapshot = alloc.clone();
        if snapshot.is_empty() {
            self.pools.remove(pool_id);
        }
        snapshot
    }
}

#[derive(Debug)]
pub struct AllocationTracker {
    shards: Box<[Mutex<Shard>]>,
}

impl AllocationTracker {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard(&self, pool_id: &str) -> MutexGuard<'_, Shard> {
        let mut h = DefaultHasher::new();
        pool_id.hash(&mut h);
        let idx = (h.finish() as usize) % self.shards.len();
        // 分片内没有会 panic 的逻辑，中毒时直接沿用内部状态。
        self.shards[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前预留快照。
    pub fn snapshot(&self, pool_id: &str) -> PoolWorkloadAllocation {
        self.shard(pool_id).allocation(pool_id)
    }

    /// 直接增加预留并返回更新后的快照（不登记在途记录）。
    pub fn reserve(
        &self,
        pool_id: &str,
        resource_id: &str,
        requests: u64,
        tokens: u64,
    ) -> PoolWorkloadAllocation {
        self.shard(pool_id)
            .add(pool_id, resource_id, Usage::new(requests, tokens))
    }

    /// 直接扣减预留，在零处截断。
    pub fn release(
        &self,
        pool_id: &str,
        resource_id: &str,
        requests: u64,
        tokens: u64,
    ) -> PoolWorkloadAllocation {
        self.shard(pool_id)
            .sub(pool_id, resource_id, Usage::new(requests, tokens))
    }

    /// 在分片锁内基于当前快照做判定；`decide` 返回 Ok 时提交预留并登记在途记录。
    ///
    /// 判定与提交之间不存在窗口，并发请求不会读到同一份“旧”预留而一起放行。
    pub fn reserve_if<T>(
        &self,
        pool_id: &str,
        hold: Hold,
        now: Instant,
        decide: impl FnOnce(&PoolWorkloadAllocation) -> Result<T, T>,
    ) -> Result<(T, ReservationTicket, PoolWorkloadAllocation), T> {
        let mut shard = self.shard(pool_id);
        let current = shard.allocation(pool_id);
        let decided = decide(&current)?;

        let committed = shard.add(pool_id, &hold.resource_id, hold.amount);
        let ticket = ReservationTicket {
            id: Uuid::new_v4(),
            pool_id: pool_id.to_string(),
            resource_id: hold.resource_id,
        };
        shard.in_flight.insert(
            ticket.id,
            InFlight {
                ticket: ticket.clone(),
                connection_id: hold.connection_id,
                amount: hold.amount,
                request_time: hold.request_time,
                created_at: now,
                item: hold.item,
            },
        );
        Ok((decided, ticket, committed))
    }

    /// 按凭据释放预留。重复释放返回 None，不会把预留扣成负数。
    pub fn release_reservation(&self, ticket: &ReservationTicket) -> Option<InFlight> {
        let mut shard = self.shard(&ticket.pool_id);
        let record = shard.in_flight.remove(&ticket.id)?;
        shard.sub(
            &record.ticket.pool_id,
            &record.ticket.resource_id,
            record.amount,
        );
        Some(record)
    }

    /// 完成回报时摘下在途记录，但保留其预留量。
    ///
    /// 用量写入指标存储之前，这份容量仍由预留覆盖；写入结束后调用 `release_claimed`。
    /// 摘下后的记录不再参与清扫，重复回报返回 None。
    pub fn claim_reservation(&self, ticket: &ReservationTicket) -> Option<InFlight> {
        self.shard(&ticket.pool_id).in_flight.remove(&ticket.id)
    }

    /// 扣减一条已摘下记录的预留量。
    pub fn release_claimed(&self, record: &InFlight) -> PoolWorkloadAllocation {
        self.shard(&record.ticket.pool_id).sub(
            &record.ticket.pool_id,
            &record.ticket.resource_id,
            record.amount,
        )
    }

    /// 强制释放在途时长达到 `max_in_flight` 的预留。
    pub fn sweep_expired(&self, now: Instant, max_in_flight: Duration) -> Vec<LeakedReservation> {
        let mut leaked = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let expired: Vec<Uuid> = shard
                .in_flight
                .iter()
                .filter(|(_, r)| now.saturating_duration_since(r.created_at) >= max_in_flight)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                let Some(record) = shard.in_flight.remove(&id) else {
                    continue;
                };
                shard.sub(
                    &record.ticket.pool_id,
                    &record.ticket.resource_id,
                    record.amount,
                );
                let age = now.saturating_duration_since(record.created_at);
                leaked.push(LeakedReservation {
                    reservation: record,
                    age,
                });
            }
        }
        leaked
    }

    /// 所有非空池的预留快照（按 poolId 排序）与在途记录总数。
    pub fn stats(&self) -> (Vec<PoolWorkloadAllocation>, usize) {
        let mut pools = Vec::new();
        let mut in_flight = 0usize;
        for shard in self.shards.iter() {
            let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            in_flight += shard.in_flight.len();
            pools.extend(shard.pools.values().filter(|a| !a.is_empty()).cloned());
        }
        pools.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        (pools, in_flight)
    }
}

impl Default for AllocationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}
