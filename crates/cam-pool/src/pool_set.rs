//! Keyed registry of buffer pools.

use crate::allocator::Allocator;
use crate::buffer_pool::{Buffer, BufferPool, PoolSpec, PoolStats};
use crate::PoolError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Pools keyed by tag. Every pool must be created before its first acquire.
pub struct PoolSet<K> {
    pools: RwLock<HashMap<K, BufferPool>>,
}

impl<K> PoolSet<K>
where
    K: Eq + Hash + Clone + Display,
{
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Builds and registers a pool for `key`.
    pub fn create(
        &self,
        key: K,
        spec: PoolSpec,
        allocator: Arc<dyn Allocator>,
    ) -> Result<BufferPool, PoolError> {
        let mut pools = self.pools.write();
        if pools.contains_key(&key) {
            return Err(PoolError::DuplicatePool(key.to_string()));
        }
        let pool = BufferPool::new(spec, allocator)?;
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Pool registered for `key`.
    pub fn get(&self, key: &K) -> Result<BufferPool, PoolError> {
        self.pools
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| PoolError::UnknownPool(key.to_string()))
    }

    /// Whether a pool exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.pools.read().contains_key(key)
    }

    /// Acquires from the pool for `key` without waiting.
    pub fn try_acquire(&self, key: &K) -> Result<Buffer, PoolError> {
        self.get(key)?.try_acquire()
    }

    /// Acquires from the pool for `key`, waiting up to `timeout`.
    pub async fn acquire_timeout(&self, key: &K, timeout: Duration) -> Result<Buffer, PoolError> {
        let pool = self.get(key)?;
        pool.acquire_timeout(timeout).await
    }

    /// Returns a buffer to the pool it came from.
    pub fn release(&self, buffer: Buffer) {
        buffer.release();
    }

    /// Statistics for every pool.
    #[must_use]
    pub fn stats(&self) -> Vec<(K, PoolStats)> {
        self.pools
            .read()
            .iter()
            .map(|(key, pool)| (key.clone(), pool.stats()))
            .collect()
    }

    /// True when every pool got all of its buffers back.
    #[must_use]
    pub fn is_fully_reclaimed(&self) -> bool {
        self.pools.read().values().all(BufferPool::is_fully_reclaimed)
    }

    /// Waits until every pool is fully reclaimed, sharing one `timeout` budget.
    pub async fn wait_reclaimed(&self, timeout: Duration) -> bool {
        let pools: Vec<BufferPool> = self.pools.read().values().cloned().collect();
        let deadline = tokio::time::Instant::now() + timeout;
        for pool in pools {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !pool.wait_reclaimed(remaining).await {
                return false;
            }
        }
        true
    }

    /// Frees idle buffers of every on-demand pool.
    pub fn trim_on_demand(&self) -> usize {
        self.pools.read().values().map(BufferPool::trim).sum()
    }

    /// Number of registered pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    /// Whether no pool is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Drops every pool registration. Buffers still out keep their pool alive until returned.
    pub fn clear(&self) {
        self.pools.write().clear();
    }
}

impl<K> Default for PoolSet<K>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for PoolSet<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSet")
            .field("pools", &self.pools.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{BufferLayout, HeapAllocator};

    fn set() -> PoolSet<String> {
        let set = PoolSet::new();
        set.create(
            "sensor:forward".to_string(),
            PoolSpec::fixed("sensor:forward", 2, BufferLayout::single_plane(16)),
            Arc::new(HeapAllocator),
        )
        .unwrap();
        set
    }

    #[test]
    fn unknown_and_duplicate_tags() {
        let set = set();
        assert!(matches!(
            set.try_acquire(&"isp:forward".to_string()),
            Err(PoolError::UnknownPool(_))
        ));
        let dup = set.create(
            "sensor:forward".to_string(),
            PoolSpec::fixed("sensor:forward", 1, BufferLayout::single_plane(16)),
            Arc::new(HeapAllocator),
        );
        assert!(matches!(dup, Err(PoolError::DuplicatePool(_))));
    }

    #[test]
    fn reclaim_tracking() {
        let set = set();
        let key = "sensor:forward".to_string();
        let buffer = set.try_acquire(&key).unwrap();
        assert!(!set.is_fully_reclaimed());
        set.release(buffer);
        assert!(set.is_fully_reclaimed());
        assert_eq!(set.stats().len(), 1);
    }

    #[tokio::test]
    async fn wait_reclaimed_shares_budget() {
        let set = set();
        let key = "sensor:forward".to_string();
        let _held = set.try_acquire(&key).unwrap();
        assert!(!set.wait_reclaimed(Duration::from_millis(10)).await);
    }
}
