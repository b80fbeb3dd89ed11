use crate::allocation::{AllocationTracker, Hold, LeakedReservation};
use crate::gate::{
    CompletionReport, CompletionResult, Disposition, DueSummary, GateDecision,
    GateError, GateStats, ItemStatus, Outcome,
};
use crate::logging;
use crate::metrics::{MetricsRepository, UsageRecorder, UsageSample};
use crate::queue::{
    AdmissionQueue, DeadLetter, DeadLetterQueue, GateRequest, ItemContext, QueueError, QueueItem,
};
use crate::quota_pool::{
    AIConnection, Candidate, PoolDefinition, PoolRegistry, Usage, select_entry_excluding,
};
use crate::runtime_config::{FailPolicy, RuntimeSettings, SettingsHandle};
use crate::strategy::{
    GateInput, GateOutput, PrioritizationStrategy, RuleCheck, UsageSnapshot, base_checks,
};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const STATUS_TTL: Duration = Duration::from_secs(60 * 60);
const STATUS_CAPACITY: u64 = 100_000;
/// 单轮最多重新判定的 item 数，避免一次 drain 长时间占用调度任务。
const DUE_BATCH: usize = 512;

/// 编排器依赖的全部组件。
pub struct GateComponents {
    pub pools: Arc<PoolRegistry>,
    pub repo: Arc<MetricsRepository>,
    pub tracker: Arc<AllocationTracker>,
    pub strategy: Arc<dyn PrioritizationStrategy>,
    pub queue: Arc<AdmissionQueue>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub settings: SettingsHandle,
    /// 用量写入队列容量。
    pub recorder_capacity: usize,
}

pub struct GateOrchestrator {
    pools: Arc<PoolRegistry>,
    repo: Arc<MetricsRepository>,
    recorder: UsageRecorder,
    tracker: Arc<AllocationTracker>,
    strategy: Arc<dyn PrioritizationStrategy>,
    queue: Arc<AdmissionQueue>,
    dead_letters: Arc<DeadLetterQueue>,
    settings: SettingsHandle,
    statuses: Cache<Uuid, ItemStatus>,
}

impl std::fmt::Debug for GateOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateOrchestrator")
            .field("strategy", &self.strategy.name())
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl GateOrchestrator {
    pub fn new(c: GateComponents) -> Self {
        // 写入器与编排器共用同一个跟踪器，写入结束后由它释放预留。
        let recorder =
            UsageRecorder::spawn(c.repo.clone(), c.tracker.clone(), c.recorder_capacity);
        Self {
            pools: c.pools,
            repo: c.repo,
            recorder,
            tracker: c.tracker,
            strategy: c.strategy,
            queue: c.queue,
            dead_letters: c.dead_letters,
            settings: c.settings,
            statuses: Cache::builder()
                .max_capacity(STATUS_CAPACITY)
                .time_to_live(STATUS_TTL)
                .build(),
        }
    }

    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// 入口：对一次新请求做判定。拒绝时 item 以 retry_count = 0 入队。
    pub async fn gate_request(
        &self,
        request: GateRequest,
        request_time: DateTime<Utc>,
        payload: serde_json::Value,
        context: ItemContext,
    ) -> Result<GateDecision, GateError> {
        let item = QueueItem::new(request, payload, context);
        self.gate_item(item, request_time, Instant::now()).await
    }

    /// 对一个 item（新请求或到期重试）执行完整判定流程。
    pub async fn gate_item(
        &self,
        item: QueueItem,
        request_time: DateTime<Utc>,
        now: Instant,
    ) -> Result<GateDecision, GateError> {
        let settings = self.settings.get();
        let pool = self
            .pools
            .get(&item.request.pool_id)
            .ok_or_else(|| GateError::UnknownPool(item.request.pool_id.clone()))?;

        let usage = match UsageSnapshot::collect(&self.repo, &pool, request_time).await {
            Ok(usage) => usage,
            Err(e) => match settings.fail_policy {
                FailPolicy::Open => {
                    tracing::warn!(pool_id = %pool.id, error = %e, "读取用量失败，按 fail-open 视为 0");
                    UsageSnapshot::default()
                }
                FailPolicy::Closed => {
                    tracing::warn!(pool_id = %pool.id, error = %e, "读取用量失败，按 fail-closed 拒绝");
                    let out = GateOutput::deny_with_reason(
                        self.tracker.snapshot(&pool.id),
                        format!("metrics unavailable: {e}"),
                    );
                    return Ok(self.defer(item, out, &settings, now).await);
                }
            },
        };

        let (resource_id, connection) =
            self.resolve_entry(&pool, &item.request, &usage, &settings)?;

        let hold = Hold {
            resource_id: resource_id.clone(),
            connection_id: connection.id.clone(),
            amount: Usage::new(1, item.request.request_tokens),
            request_time,
            item: Some(item.clone()),
        };
        let verdict = self.tracker.reserve_if(&pool.id, hold, now, |alloc| {
            let input = GateInput {
                pool: &pool,
                request_time,
                request_tokens: item.request.request_tokens,
                resource_id: &resource_id,
                connection: &connection,
                usage: &usage,
                allocation: Some(alloc),
                near_limit_ratio: settings.near_limit_ratio,
            };
            let out = self.strategy.gate(&input);
            if out.allowed { Ok(out) } else { Err(out) }
        });

        match verdict {
            Ok((mut out, ticket, committed)) => {
                out.allocation = committed;
                logging::admitted(settings.log_level(), &item, &ticket, &out);
                self.statuses
                    .insert(
                        item.id,
                        ItemStatus::Admitted {
                            ticket: ticket.clone(),
                            connection_id: connection.id.clone(),
                        },
                    )
                    .await;
                Ok(GateDecision {
                    output: out,
                    disposition: Disposition::Admitted {
                        ticket,
                        connection_id: connection.id,
                    },
                })
            }
            Err(out) => Ok(self.defer(item, out, &settings, now).await),
        }
    }

    /// 确定本次判定针对的条目与连接。
    fn resolve_entry(
        &self,
        pool: &PoolDefinition,
        request: &GateRequest,
        usage: &UsageSnapshot,
        settings: &RuntimeSettings,
    ) -> Result<(String, AIConnection), GateError> {
        // 没有条目的池只有池级规则，资源标识由调用方给出。
        if pool.entries.is_empty() {
            let id = request
                .resource_id
                .clone()
                .or_else(|| request.connection_id.clone())
                .ok_or_else(|| GateError::NoEligibleEntry(pool.id.clone()))?;
            let connection = AIConnection {
                id: request.connection_id.clone().unwrap_or_else(|| id.clone()),
                provider: String::new(),
                max_concurrency: None,
            };
            return Ok((id, connection));
        }

        if let Some(rid) = &request.resource_id {
            let entry = pool
                .entry(rid)
                .ok_or_else(|| GateError::UnknownResource {
                    pool_id: pool.id.clone(),
                    resource_id: rid.clone(),
                })?;
            return Ok((entry.resource_id.clone(), entry.connection.clone()));
        }

        if let Some(cid) = &request.connection_id {
            let entry = pool
                .entries
                .iter()
                .find(|e| &e.connection.id == cid)
                .ok_or_else(|| GateError::UnknownConnection {
                    pool_id: pool.id.clone(),
                    connection_id: cid.clone(),
                })?;
            return Ok((entry.resource_id.clone(), entry.connection.clone()));
        }

        let alloc = self.tracker.snapshot(&pool.id);
        let mut full = HashSet::new();
        let mut headrooms = Vec::with_capacity(pool.entries.len());
        for entry in &pool.entries {
            let input = GateInput {
                pool,
                request_time: Utc::now(),
                request_tokens: request.request_tokens,
                resource_id: &entry.resource_id,
                connection: &entry.connection,
                usage,
                allocation: Some(&alloc),
                near_limit_ratio: settings.near_limit_ratio,
            };
            let checks = base_checks(&input, &alloc);
            if checks.iter().any(RuleCheck::exceeded) {
                full.insert(entry.resource_id.clone());
            }
            headrooms.push(headroom(&checks));
        }
        let candidates: Vec<Candidate<'_>> = pool
            .entries
            .iter()
            .zip(headrooms)
            .map(|(e, headroom)| Candidate {
                resource_id: &e.resource_id,
                headroom,
            })
            .collect();

        // 全部已满时仍按第一个条目判定，让拒绝原因指向具体规则。
        let picked = select_entry_excluding(&candidates, &full)
            .unwrap_or_else(|| pool.entries[0].resource_id.clone());
        let entry = pool
            .entry(&picked)
            .ok_or_else(|| GateError::UnknownResource {
                pool_id: pool.id.clone(),
                resource_id: picked.clone(),
            })?;
        Ok((entry.resource_id.clone(), entry.connection.clone()))
    }

    /// 拒绝后的去向：不可能满足或重试耗尽进死信，否则按退避入队。
    async fn defer(
        &self,
        mut item: QueueItem,
        out: GateOutput,
        settings: &RuntimeSettings,
        now: Instant,
    ) -> GateDecision {
        item.metadata.last_reason = out.reason.clone();
        logging::denied(settings.log_level(), &item, &out);

        let reason = out.reason.clone().unwrap_or_else(|| "denied".to_string());
        let disposition = if out.unsatisfiable() {
            self.dead_letter(item, format!("unsatisfiable: {reason}"))
                .await
        } else {
            self.requeue(item, reason, settings, now).await
        };
        GateDecision {
            output: out,
            disposition,
        }
    }

    async fn requeue(
        &self,
        item: QueueItem,
        reason: String,
        settings: &RuntimeSettings,
        now: Instant,
    ) -> Disposition {
        let retry_count = item.metadata.retry_count;
        if retry_count >= settings.backoff.max_retries {
            return self
                .dead_letter(
                    item,
                    format!("retry exhausted after {retry_count} retries: {reason}"),
                )
                .await;
        }

        let delay = settings.backoff.delay_for(retry_count);
        let item_id = item.id;
        match self.queue.push(item, delay, now).await {
            Ok(()) => {
                let retry_after_ms = delay.as_millis() as u64;
                self.statuses
                    .insert(
                        item_id,
                        ItemStatus::Queued {
                            retry_count,
                            retry_after_ms,
                            reason: Some(reason),
                        },
                    )
                    .await;
                Disposition::Queued {
                    item_id,
                    retry_count,
                    retry_after_ms,
                }
            }
            Err(QueueError::Full { capacity, item }) => {
                self.dead_letter(*item, format!("queue full (capacity {capacity}): {reason}"))
                    .await
            }
        }
    }

    async fn dead_letter(&self, item: QueueItem, reason: String) -> Disposition {
        let item_id = item.id;
        self.statuses
            .insert(
                item_id,
                ItemStatus::DeadLettered {
                    reason: reason.clone(),
                },
            )
            .await;
        self.dead_letters
            .push(DeadLetter {
                item,
                reason: reason.clone(),
                failed_at: Utc::now(),
            })
            .await;
        Disposition::DeadLettered { item_id, reason }
    }

    /// 重新判定所有到期 item。retry_count 在每次重新尝试前递增。
    ///
    /// 重试放行的结果写入 item 状态，执行方通过 `/v1/queue/{id}` 轮询取得凭据。
    pub async fn process_due(&self, now: Instant) -> DueSummary {
        let mut summary = DueSummary::default();
        for mut item in self.queue.drain_due(now, DUE_BATCH).await {
            item.metadata.retry_count = item.metadata.retry_count.saturating_add(1);
            summary.offered += 1;

            let fallback = item.clone();
            match self.gate_item(item, Utc::now(), now).await {
                Ok(decision) => match decision.disposition {
                    Disposition::Admitted { .. } => summary.admitted += 1,
                    Disposition::Queued { .. } => summary.requeued += 1,
                    Disposition::DeadLettered { .. } => summary.dead_lettered += 1,
                },
                Err(e) => {
                    // 池或条目在排队期间被移除，item 无法再判定。
                    self.dead_letter(fallback, e.to_string()).await;
                    summary.dead_lettered += 1;
                }
            }
        }
        if summary.offered > 0 {
            tracing::debug!(
                offered = summary.offered,
                admitted = summary.admitted,
                requeued = summary.requeued,
                dead_lettered = summary.dead_lettered,
                "到期重试处理完成"
            );
        }
        summary
    }

    /// 执行完成回报：计量实际用量并在写入后释放预留；瞬时失败时重新排队。
    pub async fn report_completion(&self, report: CompletionReport) -> CompletionResult {
        let Some(mut record) = self.tracker.claim_reservation(&report.ticket) else {
            tracing::warn!(
                reservation_id = %report.ticket.id,
                pool_id = %report.ticket.pool_id,
                "完成回报对应的预留不存在（重复回报或已被清扫）"
            );
            return CompletionResult::UnknownReservation;
        };

        let item = record.item.take();
        self.recorder.record(UsageSample {
            request_time: record.request_time,
            pool_id: record.ticket.pool_id.clone(),
            connection_id: record.connection_id.clone(),
            tokens: report.actual_tokens.unwrap_or(record.amount.tokens),
            reservation: Some(record),
        });

        let Some(item) = item else {
            return CompletionResult::Recorded;
        };

        match report.outcome {
            Outcome::Success | Outcome::Failure => {
                self.statuses.insert(item.id, ItemStatus::Completed).await;
                CompletionResult::Recorded
            }
            Outcome::TransientFailure => {
                let settings = self.settings.get();
                let item_id = item.id;
                match self
                    .requeue(
                        item,
                        "transient failure".to_string(),
                        &settings,
                        Instant::now(),
                    )
                    .await
                {
                    Disposition::Queued { retry_after_ms, .. } => CompletionResult::Requeued {
                        item_id,
                        retry_after_ms,
                    },
                    _ => CompletionResult::DeadLettered { item_id },
                }
            }
        }
    }

    /// 强制释放超过最长在途时长的预留。
    pub async fn sweep_reservations(&self, now: Instant) -> Vec<LeakedReservation> {
        let settings = self.settings.get();
        let leaked = self.tracker.sweep_expired(now, settings.max_in_flight());
        for leak in &leaked {
            logging::reservation_leaked(settings.log_level(), leak);
            let reservation_id = leak.reservation.ticket.id;
            if let Some(item) = &leak.reservation.item {
                self.statuses
                    .insert(item.id, ItemStatus::ReservationExpired { reservation_id })
                    .await;
            }
        }
        leaked
    }

    pub async fn item_status(&self, item_id: Uuid) -> Option<ItemStatus> {
        self.statuses.get(&item_id).await
    }

    pub async fn stats(&self) -> GateStats {
        let (reservations, in_flight) = self.tracker.stats();
        GateStats {
            strategy: self.strategy.name(),
            pools: self.pools.len(),
            queue_depth: self.queue.depth_by_class().await,
            queued_total: self.queue.len().await,
            dead_lettered_total: self.dead_letters.total(),
            in_flight,
            reservations,
        }
    }

    pub async fn recent_dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.recent().await
    }
}

/// 条目剩余余量：所有规则中最紧的那条，已满时为负（选择器按 0 处理）。
fn headroom(checks: &[RuleCheck]) -> f64 {
    checks
        .iter()
        .map(|c| {
            let max = c.limit.max();
            if max == 0 {
                return 0.0;
            }
            1.0 - c.used.saturating_add(c.cost) as f64 / max as f64
        })
        .fold(1.0, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{
        BucketKey, MemoryMetricsStore, MetricsError, MetricsStore, RepositorySettings,
    };
    use crate::quota_pool::{PoolDefinitionEntry, QuotaRule};
    use crate::runtime_config::BackoffPolicy;
    use crate::strategy::WindowQuotaStrategy;
    use async_trait::async_trait;

    struct DownStore;

    #[async_trait]
    impl MetricsStore for DownStore {
        async fn increment(&self, _key: &BucketKey, _delta: Usage) -> Result<(), MetricsError> {
            Err(MetricsError::unavailable("connection refused"))
        }

        async fn read(&self, _keys: &[BucketKey]) -> Result<Vec<Usage>, MetricsError> {
            Err(MetricsError::unavailable("connection refused"))
        }
    }

    fn entry(rid: &str) -> PoolDefinitionEntry {
        PoolDefinitionEntry {
            resource_id: rid.to_string(),
            connection: AIConnection {
                id: format!("conn-{rid}"),
                provider: "openai".to_string(),
                max_concurrency: None,
            },
            rules: Vec::new(),
            weight: 1,
        }
    }

    fn pool(max_requests: u64, entries: &[&str]) -> PoolDefinition {
        PoolDefinition {
            id: "gpt".to_string(),
            name: "GPT".to_string(),
            rules: vec![QuotaRule::requests(max_requests, 60)],
            entries: entries.iter().map(|rid| entry(rid)).collect(),
        }
    }

    fn settings() -> SettingsHandle {
        SettingsHandle::new(RuntimeSettings {
            backoff: BackoffPolicy {
                max_retries: 5,
                base_delay_ms: 100,
                max_delay_ms: 10_000,
            },
            ..RuntimeSettings::default()
        })
    }

    fn build(
        store: Arc<dyn MetricsStore>,
        repo_settings: RepositorySettings,
        pools: Vec<PoolDefinition>,
        queue_capacity: usize,
    ) -> GateOrchestrator {
        GateOrchestrator::new(GateComponents {
            pools: Arc::new(PoolRegistry::new(pools)),
            repo: Arc::new(MetricsRepository::new(store, repo_settings)),
            tracker: Arc::new(AllocationTracker::default()),
            strategy: Arc::new(WindowQuotaStrategy),
            queue: Arc::new(AdmissionQueue::new(queue_capacity)),
            dead_letters: Arc::new(DeadLetterQueue::in_memory()),
            settings: settings(),
            recorder_capacity: 64,
        })
    }

    fn orchestrator_with(store: Arc<dyn MetricsStore>, pools: Vec<PoolDefinition>) -> GateOrchestrator {
        build(
            store,
            RepositorySettings {
                read_attempts: 1,
                ..RepositorySettings::default()
            },
            pools,
            64,
        )
    }

    fn orchestrator(pools: Vec<PoolDefinition>) -> GateOrchestrator {
        orchestrator_with(
            Arc::new(MemoryMetricsStore::new(Duration::from_secs(3600))),
            pools,
        )
    }

    fn request(resource_id: Option<&str>) -> GateRequest {
        GateRequest {
            pool_id: "gpt".to_string(),
            resource_id: resource_id.map(str::to_string),
            connection_id: None,
            request_tokens: 10,
            priority: Default::default(),
        }
    }

    /// 预留在用量写入后异步释放，等到池内预留清空。
    async fn wait_released(o: &GateOrchestrator) -> bool {
        for _ in 0..100 {
            if o.tracker.snapshot("gpt").is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    async fn gate(o: &GateOrchestrator, resource_id: Option<&str>) -> GateDecision {
        o.gate_request(
            request(resource_id),
            Utc::now(),
            serde_json::Value::Null,
            ItemContext::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn admit_commits_reservation_and_deny_enqueues() {
        let o = orchestrator(vec![pool(1, &["east"])]);

        let first = gate(&o, Some("east")).await;
        assert!(first.output.allowed);
        assert_eq!(first.output.allocation.total, Usage::new(1, 10));
        assert!(matches!(first.disposition, Disposition::Admitted { .. }));

        let second = gate(&o, Some("east")).await;
        assert!(!second.output.allowed);
        assert!(second.output.reason.as_deref().unwrap().contains("1/1"));
        let Disposition::Queued {
            item_id,
            retry_count,
            retry_after_ms,
        } = second.disposition
        else {
            panic!("expected queued: {:?}", second.disposition);
        };
        assert_eq!(retry_count, 0);
        assert_eq!(retry_after_ms, 100);
        assert!(matches!(
            o.item_status(item_id).await,
            Some(ItemStatus::Queued { .. })
        ));
        assert_eq!(o.queue.len().await, 1);
    }

    #[tokio::test]
    async fn queued_item_is_admitted_on_third_retry_and_not_retried_again() {
        let o = orchestrator(vec![pool(1, &["east"])]);
        // 外部预留占满容量。
        o.tracker.reserve("gpt", "east", 1, 0);

        let t0 = Instant::now();
        let decision = gate(&o, Some("east")).await;
        let Disposition::Queued { item_id, .. } = decision.disposition else {
            panic!("expected queued");
        };

        let mut delays = Vec::new();
        for round in 1..=3u64 {
            if round == 3 {
                o.tracker.release("gpt", "east", 1, 0);
            }
            let now = t0 + Duration::from_secs(3600 * round);
            let summary = o.process_due(now).await;
            assert_eq!(summary.offered, 1);
            match o.item_status(item_id).await.unwrap() {
                ItemStatus::Queued {
                    retry_count,
                    retry_after_ms,
                    ..
                } => {
                    assert_eq!(retry_count as u64, round);
                    delays.push(retry_after_ms);
                }
                ItemStatus::Admitted { ticket, .. } => {
                    assert_eq!(round, 3);
                    assert_eq!(summary.admitted, 1);
                    assert_eq!(ticket.resource_id, "east");
                }
                other => panic!("unexpected status {other:?}"),
            }
        }
        assert_eq!(delays, vec![200, 400]);
        assert!(o.queue.is_empty().await);
        assert_eq!(
            o.process_due(t0 + Duration::from_secs(3600 * 10)).await,
            DueSummary::default()
        );
    }

    #[tokio::test]
    async fn exhausted_item_is_dead_lettered_and_not_requeued() {
        let o = orchestrator(vec![pool(1, &["east"])]);
        o.tracker.reserve("gpt", "east", 1, 0);

        let t0 = Instant::now();
        let decision = gate(&o, Some("east")).await;
        let Disposition::Queued { item_id, .. } = decision.disposition else {
            panic!("expected queued");
        };

        let mut dead = 0;
        for round in 1..=10u64 {
            let s = o.process_due(t0 + Duration::from_secs(3600 * round)).await;
            dead += s.dead_lettered;
        }
        assert_eq!(dead, 1);
        assert!(o.queue.is_empty().await);
        assert_eq!(o.dead_letters.total(), 1);

        let letters = o.recent_dead_letters().await;
        assert_eq!(letters[0].item.id, item_id);
        assert_eq!(letters[0].item.metadata.retry_count, 5);
        assert!(letters[0].reason.starts_with("retry exhausted"));
        assert!(matches!(
            o.item_status(item_id).await,
            Some(ItemStatus::DeadLettered { .. })
        ));
    }

    #[tokio::test]
    async fn sweep_frees_capacity_of_unreported_reservation() {
        let o = orchestrator(vec![pool(1, &["east"])]);
        let first = gate(&o, Some("east")).await;
        let Disposition::Admitted { ticket, .. } = first.disposition else {
            panic!("expected admitted");
        };
        assert!(!gate(&o, Some("east")).await.output.allowed);

        let max = o.settings.get().max_in_flight();
        let leaked = o.sweep_reservations(Instant::now() + max).await;
        assert_eq!(leaked.len(), 1);
        assert_eq!(leaked[0].reservation.ticket, ticket);
        let swept_item = leaked[0].reservation.item.as_ref().unwrap().id;
        assert!(matches!(
            o.item_status(swept_item).await,
            Some(ItemStatus::ReservationExpired { .. })
        ));

        assert!(gate(&o, Some("east")).await.output.allowed);
        // 迟到的回报不会再扣一次。
        assert_eq!(
            o.report_completion(CompletionReport {
                ticket,
                actual_tokens: Some(5),
                outcome: Outcome::Success,
            })
            .await,
            CompletionResult::UnknownReservation
        );
    }

    #[tokio::test]
    async fn completion_releases_once_and_records_actual_usage() {
        let o = orchestrator(vec![pool(10, &["east"])]);
        let decision = gate(&o, Some("east")).await;
        let Disposition::Admitted { ticket, .. } = decision.disposition else {
            panic!("expected admitted");
        };

        let report = CompletionReport {
            ticket: ticket.clone(),
            actual_tokens: Some(42),
            outcome: Outcome::Success,
        };
        assert_eq!(
            o.report_completion(report.clone()).await,
            CompletionResult::Recorded
        );
        assert_eq!(
            o.report_completion(report).await,
            CompletionResult::UnknownReservation
        );
        assert!(wait_released(&o).await);

        let mut got = Usage::default();
        for _ in 0..100 {
            got = o
                .repo
                .get_pool_metric_by_window(Utc::now(), 60, "gpt")
                .await
                .unwrap();
            if got.requests == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(got, Usage::new(1, 42));
    }

    #[tokio::test]
    async fn transient_failure_requeues_the_original_item() {
        let o = orchestrator(vec![pool(10, &["east"])]);
        let decision = gate(&o, Some("east")).await;
        let Disposition::Admitted { ticket, .. } = decision.disposition else {
            panic!("expected admitted");
        };
        let result = o
            .report_completion(CompletionReport {
                ticket,
                actual_tokens: None,
                outcome: Outcome::TransientFailure,
            })
            .await;
        let CompletionResult::Requeued { item_id, .. } = result else {
            panic!("expected requeued: {result:?}");
        };
        let queued = o
            .queue
            .drain_due(Instant::now() + Duration::from_secs(3600), 8)
            .await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, item_id);
        assert!(wait_released(&o).await);
    }

    #[tokio::test]
    async fn long_lived_reservation_still_requeues_on_transient_failure() {
        let o = orchestrator(vec![pool(10, &["east"])]);
        let current = o.settings.get();
        o.settings
            .update(RuntimeSettings {
                max_in_flight_secs: 7200,
                ..(*current).clone()
            })
            .unwrap();

        let decision = gate(&o, Some("east")).await;
        let Disposition::Admitted { ticket, .. } = decision.disposition else {
            panic!("expected admitted");
        };
        // 超过一小时仍在最长在途时长之内，item 跟随预留保留。
        assert!(
            o.sweep_reservations(Instant::now() + Duration::from_secs(3700))
                .await
                .is_empty()
        );
        let result = o
            .report_completion(CompletionReport {
                ticket,
                actual_tokens: None,
                outcome: Outcome::TransientFailure,
            })
            .await;
        assert!(matches!(result, CompletionResult::Requeued { .. }));
        assert_eq!(o.queue.len().await, 1);
    }

    #[tokio::test]
    async fn completed_capacity_stays_covered_until_usage_is_written() {
        let o = orchestrator(vec![pool(1, &["east"])]);
        let mut admitted = 0;
        for _ in 0..20 {
            let d = gate(&o, Some("east")).await;
            if let Disposition::Admitted { ticket, .. } = d.disposition {
                admitted += 1;
                o.report_completion(CompletionReport {
                    ticket,
                    actual_tokens: Some(1),
                    outcome: Outcome::Success,
                })
                .await;
                // 预留释放时用量必须已经可读。
                assert!(wait_released(&o).await);
            }
        }
        assert_eq!(admitted, 1);
        let used = o
            .repo
            .get_pool_metric_by_window(Utc::now(), 60, "gpt")
            .await
            .unwrap();
        assert_eq!(used.requests, 1);
    }

    #[tokio::test]
    async fn full_queue_dead_letters_the_overflowing_item() {
        let o = build(
            Arc::new(MemoryMetricsStore::new(Duration::from_secs(3600))),
            RepositorySettings::default(),
            vec![pool(1, &["east"])],
            1,
        );
        o.tracker.reserve("gpt", "east", 1, 0);

        let first = gate(&o, Some("east")).await;
        assert!(matches!(first.disposition, Disposition::Queued { .. }));
        let second = gate(&o, Some("east")).await;
        let Disposition::DeadLettered { item_id, reason } = second.disposition else {
            panic!("expected dead-lettered: {:?}", second.disposition);
        };
        assert!(reason.starts_with("queue full"));
        assert_eq!(o.queue.len().await, 1);
        assert_eq!(o.dead_letters.total(), 1);
        assert_eq!(o.recent_dead_letters().await[0].item.id, item_id);
    }

    /// 读取永远不会在超时内返回。
    struct SlowStore(MemoryMetricsStore);

    #[async_trait]
    impl MetricsStore for SlowStore {
        async fn increment(&self, key: &BucketKey, delta: Usage) -> Result<(), MetricsError> {
            self.0.increment(key, delta).await
        }

        async fn read(&self, keys: &[BucketKey]) -> Result<Vec<Usage>, MetricsError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.0.read(keys).await
        }
    }

    #[tokio::test]
    async fn read_timeout_follows_fail_policy() {
        let o = build(
            Arc::new(SlowStore(MemoryMetricsStore::new(Duration::from_secs(3600)))),
            RepositorySettings {
                op_timeout: Duration::from_millis(20),
                read_attempts: 1,
                ..RepositorySettings::default()
            },
            vec![pool(10, &["east"])],
            64,
        );
        let closed = gate(&o, Some("east")).await;
        assert!(!closed.output.allowed);
        let reason = closed.output.reason.clone().unwrap();
        assert!(reason.starts_with("metrics unavailable"));
        assert!(reason.contains("超时"));
        assert!(matches!(closed.disposition, Disposition::Queued { .. }));

        let current = o.settings.get();
        o.settings
            .update(RuntimeSettings {
                fail_policy: FailPolicy::Open,
                ..(*current).clone()
            })
            .unwrap();
        let open = gate(&o, Some("east")).await;
        assert!(open.output.allowed);
    }

    #[tokio::test]
    async fn oversized_request_is_dead_lettered_immediately() {
        let mut p = pool(100, &["east"]);
        p.rules.push(QuotaRule::tokens(5, 60));
        let o = orchestrator(vec![p]);
        let decision = gate(&o, Some("east")).await;
        assert!(decision.output.unsatisfiable());
        assert!(matches!(
            decision.disposition,
            Disposition::DeadLettered { .. }
        ));
        assert!(o.queue.is_empty().await);
    }

    #[tokio::test]
    async fn fail_closed_denies_and_fail_open_admits_when_store_is_down() {
        let o = orchestrator_with(Arc::new(DownStore), vec![pool(10, &["east"])]);
        let closed = gate(&o, Some("east")).await;
        assert!(!closed.output.allowed);
        assert!(
            closed
                .output
                .reason
                .as_deref()
                .unwrap()
                .starts_with("metrics unavailable")
        );
        assert!(matches!(closed.disposition, Disposition::Queued { .. }));

        let current = o.settings.get();
        o.settings
            .update(RuntimeSettings {
                fail_policy: FailPolicy::Open,
                ..(*current).clone()
            })
            .unwrap();
        let open = gate(&o, Some("east")).await;
        assert!(open.output.allowed);
    }

    #[tokio::test]
    async fn unknown_pool_and_resource_are_errors_not_verdicts() {
        let o = orchestrator(vec![pool(10, &["east"])]);
        let mut req = request(None);
        req.pool_id = "claude".to_string();
        let err = o
            .gate_request(req, Utc::now(), serde_json::Value::Null, ItemContext::default())
            .await
            .unwrap_err();
        assert_eq!(err, GateError::UnknownPool("claude".to_string()));

        let err = o
            .gate_request(
                request(Some("west")),
                Utc::now(),
                serde_json::Value::Null,
                ItemContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::UnknownResource { .. }));
    }

    #[tokio::test]
    async fn unaddressed_request_avoids_full_entry() {
        let mut p = pool(100, &["east", "west"]);
        p.entries[0].rules.push(QuotaRule::requests(1, 60));
        let o = orchestrator(vec![p]);
        o.tracker.reserve("gpt", "east", 1, 0);

        for _ in 0..5 {
            let d = gate(&o, None).await;
            let Disposition::Admitted { ticket, .. } = d.disposition else {
                panic!("expected admitted");
            };
            assert_eq!(ticket.resource_id, "west");
        }
    }
}
