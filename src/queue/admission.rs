//! 准入队列：按优先级类别分队，类内 FIFO，带到期时间的延迟出队。

use crate::queue::types::{Priority, QueueItem};
use crate::queue::QueueError;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct Scheduled {
    item: QueueItem,
    not_before: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    classes: BTreeMap<Priority, VecDeque<Scheduled>>,
    len: usize,
}

#[derive(Debug)]
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// 入队，`delay` 之后才可被取出。队列已满时把 item 原样退回。
    pub async fn push(&self, item: QueueItem, delay: Duration, now: Instant) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            if state.len >= self.capacity {
                return Err(QueueError::Full {
                    capacity: self.capacity,
                    item: Box::new(item),
                });
            }
            let class = item.request.priority;
            state.classes.entry(class).or_default().push_back(Scheduled {
                item,
                not_before: now + delay,
            });
            state.len += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    /// 取出所有已到期的 item（最多 `max` 个）：高优先级类别在前，类内保持入队顺序。
    pub async fn drain_due(&self, now: Instant, max: usize) -> Vec<QueueItem> {
        let mut state = self.state.lock().await;
        let mut out = Vec::new();
        for class in Priority::ALL {
            let Some(deque) = state.classes.get_mut(&class) else {
                continue;
            };
            let mut keep = VecDeque::with_capacity(deque.len());
            while let Some(s) = deque.pop_front() {
                if out.len() < max && s.not_before <= now {
                    out.push(s.item);
                } else {
                    keep.push_back(s);
                }
            }
            *deque = keep;
        }
        state.len -= out.len();
        out
    }

    /// 最早的到期时间；队列为空时返回 None。
    pub async fn next_due(&self) -> Option<Instant> {
        let state = self.state.lock().await;
        state
            .classes
            .values()
            .flat_map(|d| d.iter().map(|s| s.not_before))
            .min()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn depth_by_class(&self) -> BTreeMap<Priority, usize> {
        let state = self.state.lock().await;
        Priority::ALL
            .into_iter()
            .map(|p| (p, state.classes.get(&p).map_or(0, VecDeque::len)))
            .collect()
    }

    /// 等待新的入队通知（调度任务用于提前唤醒）。
    pub async fn wait_for_push(&self) {
        self.notify.notified().await;
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
