use crate::quota_pool::types::PoolDefinition;
use std::collections::HashMap;
use std::sync::Arc;

/// 池定义注册表：启动时从配置加载，之后只读。
///
/// 决策路径只拿 `Arc<PoolDefinition>`，不持有注册表本身。
#[derive(Debug)]
pub struct PoolRegistry {
    pools: HashMap<String, Arc<PoolDefinition>>,
}

impl PoolRegistry {
    pub fn new(pools: Vec<PoolDefinition>) -> Self {
        Self {
            pools: normalize(pools),
        }
    }

    pub fn get(&self, pool_id: &str) -> Option<Arc<PoolDefinition>> {
        let pool_id = pool_id.trim();
        if pool_id.is_empty() {
            return None;
        }
        self.pools.get(pool_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn normalize(pools: Vec<PoolDefinition>) -> HashMap<String, Arc<PoolDefinition>> {
    let mut out = HashMap::with_capacity(pools.len());
    for mut pool in pools {
        pool.id = pool.id.trim().to_string();
        if pool.id.is_empty() {
            tracing::warn!("忽略 id 为空的池定义");
            continue;
        }
        // window=0 的规则没有意义，直接丢弃；max=0 保留，按规则原样判定。
        pool.rules.retain(|r| r.window_secs > 0);
        for entry in &mut pool.entries {
            entry.resource_id = entry.resource_id.trim().to_string();
            entry.rules.retain(|r| r.window_secs > 0);
        }
        pool.entries.retain(|e| !e.resource_id.is_empty());
        if out.contains_key(&pool.id) {
            tracing::warn!(pool_id = %pool.id, "池 id 重复，后者覆盖前者");
        }
        out.insert(pool.id.clone(), Arc::new(pool));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota_pool::types::QuotaRule;

    fn pool(id: &str) -> PoolDefinition {
        PoolDefinition {
            id: id.to_string(),
            name: id.to_string(),
            rules: vec![QuotaRule::requests(10, 60), QuotaRule::requests(10, 0)],
            entries: Vec::new(),
        }
    }

    #[test]
    fn registry_trims_ids_and_drops_zero_windows() {
        let reg = PoolRegistry::new(vec![pool("  gpt  "), pool("")]);
        assert_eq!(reg.ids(), vec!["gpt".to_string()]);
        let p = reg.get("gpt").unwrap();
        assert_eq!(p.rules, vec![QuotaRule::requests(10, 60)]);
    }

    #[test]
    fn duplicate_ids_keep_the_last_definition() {
        let mut second = pool("gpt");
        second.name = "second".to_string();
        let reg = PoolRegistry::new(vec![pool("gpt"), second, pool("claude")]);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(" gpt ").unwrap().name, "second");
        assert!(reg.get("").is_none());
    }
}
