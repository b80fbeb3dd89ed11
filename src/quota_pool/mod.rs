//! 配额池（Quota Pool）模块。
//!
//! 池定义由外部配置子系统提供，这里只负责只读发布与按余量挑选条目。

mod registry;
mod selector;
mod types;

pub use registry::PoolRegistry;
pub use selector::{Candidate, select_entry_excluding};
pub use types::{
    AIConnection, MetricKind, PoolDefinition, PoolDefinitionEntry, QuotaRule, Usage,
};
