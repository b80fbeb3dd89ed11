//! 后台任务：到期重试调度与预留清扫。

use crate::gate::GateOrchestrator;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 队列为空时的兜底唤醒间隔。
const IDLE_WAKE: Duration = Duration::from_secs(5);

/// 启动重试调度任务。
///
/// 睡到最早的到期时间或有新 item 入队，然后重新判定所有到期 item。
pub fn spawn_scheduler(orchestrator: Arc<GateOrchestrator>) {
    tokio::spawn(async move {
        loop {
            orchestrator.process_due(Instant::now()).await;

            let wait = match orchestrator.queue().next_due().await {
                Some(due) => due.saturating_duration_since(Instant::now()),
                None => IDLE_WAKE,
            };
            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = orchestrator.queue().wait_for_push() => {}
            }
        }
    });
}

/// 启动预留清扫任务，每 `interval` 执行一次。
pub fn spawn_sweep_task(orchestrator: Arc<GateOrchestrator>, interval: Duration) {
    let interval = interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let leaked = orchestrator.sweep_reservations(Instant::now()).await;
            if !leaked.is_empty() {
                tracing::warn!("预留清扫：强制释放 {} 个超时预留", leaked.len());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationTracker;
    use crate::gate::{Disposition, GateComponents, ItemStatus};
    use crate::metrics::{MemoryMetricsStore, MetricsRepository, RepositorySettings};
    use crate::queue::{AdmissionQueue, DeadLetterQueue, GateRequest, ItemContext, Priority};
    use crate::quota_pool::{PoolDefinition, PoolRegistry, QuotaRule};
    use crate::runtime_config::{BackoffPolicy, RuntimeSettings, SettingsHandle};
    use crate::strategy::WindowQuotaStrategy;
    use chrono::Utc;

    #[tokio::test]
    async fn scheduler_admits_queued_item_once_capacity_frees() {
        let repo = Arc::new(MetricsRepository::new(
            Arc::new(MemoryMetricsStore::new(Duration::from_secs(600))),
            RepositorySettings::default(),
        ));
        let tracker = Arc::new(AllocationTracker::default());
        let orchestrator = Arc::new(GateOrchestrator::new(GateComponents {
            pools: Arc::new(PoolRegistry::new(vec![PoolDefinition {
                id: "gpt".to_string(),
                name: String::new(),
                rules: vec![QuotaRule::requests(1, 60)],
                entries: Vec::new(),
            }])),
            repo,
            tracker: tracker.clone(),
            strategy: Arc::new(WindowQuotaStrategy),
            queue: Arc::new(AdmissionQueue::new(8)),
            dead_letters: Arc::new(DeadLetterQueue::in_memory()),
            settings: SettingsHandle::new(RuntimeSettings {
                backoff: BackoffPolicy {
                    max_retries: 50,
                    base_delay_ms: 10,
                    max_delay_ms: 20,
                },
                ..RuntimeSettings::default()
            }),
            recorder_capacity: 8,
        }));

        tracker.reserve("gpt", "svc", 1, 0);
        let decision = orchestrator
            .gate_request(
                GateRequest {
                    pool_id: "gpt".to_string(),
                    resource_id: Some("svc".to_string()),
                    connection_id: None,
                    request_tokens: 0,
                    priority: Priority::Interactive,
                },
                Utc::now(),
                serde_json::Value::Null,
                ItemContext::default(),
            )
            .await
            .unwrap();
        let Disposition::Queued { item_id, .. } = decision.disposition else {
            panic!("expected queued");
        };

        spawn_scheduler(orchestrator.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        tracker.release("gpt", "svc", 1, 0);

        let mut admitted = None;
        for _ in 0..500 {
            if let Some(ItemStatus::Admitted { ticket, .. }) =
                orchestrator.item_status(item_id).await
            {
                admitted = Some(ticket);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let ticket = admitted.expect("item was not admitted");
        assert_eq!(ticket.pool_id, "gpt");
        assert_eq!(ticket.resource_id, "svc");
        assert!(orchestrator.queue().is_empty().await);
    }
}
