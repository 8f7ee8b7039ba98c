//! Allocation backend with an injectable limit.

use cam_pool::{Allocator, BufferLayout, BufferStorage, HeapAllocator, PoolError};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Heap allocator that refuses to allocate more than `limit` buffers in total.
#[derive(Debug, Default)]
pub struct MockAllocator {
    limit: Option<usize>,
    live: AtomicUsize,
    total: AtomicUsize,
}

impl MockAllocator {
    /// Allocator without a limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that fails once `limit` buffers are live.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Buffers currently allocated.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Allocations performed since creation.
    #[must_use]
    pub fn total_allocations(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }
}

impl Allocator for MockAllocator {
    fn name(&self) -> &str {
        "mock"
    }

    fn allocate(&self, layout: &BufferLayout, index: u32) -> Result<BufferStorage, PoolError> {
        let limit = self.limit.unwrap_or(usize::MAX);
        if self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            })
            .is_err()
        {
            warn!(limit, index, "Mock allocator limit reached");
            return Err(PoolError::AllocationFailed {
                pool: "mock".into(),
                reason: format!("limit of {} buffers reached", limit),
            });
        }
        self.total.fetch_add(1, Ordering::AcqRel);
        HeapAllocator.allocate(layout, index)
    }

    fn free(&self, storage: BufferStorage) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        drop(storage);
    }
}
