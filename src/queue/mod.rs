//! 延迟重试：被拒绝或执行中瞬时失败的请求在这里排队，按退避节奏重新参与判定。

mod admission;
mod dead_letter;
mod types;

pub use admission::{AdmissionQueue, DEFAULT_QUEUE_CAPACITY};
pub use dead_letter::DeadLetterQueue;
pub use types::{DeadLetter, GateRequest, ItemContext, ItemMetadata, Priority, QueueItem};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("准入队列已满（容量 {capacity}）")]
    Full {
        capacity: usize,
        item: Box<QueueItem>,
    },
}
