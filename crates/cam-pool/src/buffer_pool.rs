//! Tagged buffer pool with move-only handles.
//!
//! # Memory Flow
//!
//! ```text
//! 1. Fixed pools allocate every buffer at configuration time
//! 2. On-demand pools allocate lazily, up to a ceiling
//! 3. try_acquire() moves a BufferStorage out of the free queue into a Buffer
//! 4. The Buffer travels through frame slots (moved, never copied)
//! 5. Dropping the Buffer returns the storage to the free queue,
//!    or queues the return on the release fence if it has not signalled yet
//! ```
//!
//! The semaphore counts free buffers so async waiters can suspend instead of polling.
//! Permits are only ever added after a storage has been pushed to the free queue, which keeps
//! `permits <= free queue length` at all times.

use crate::allocator::{Allocator, BufferLayout, BufferStorage, HeapAllocator};
use crate::fence::Fence;
use crate::PoolError;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// Allocation policy of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// All buffers allocated up front. Running dry is a configuration bug.
    Fixed,
    /// Buffers allocated on first use, never more than `ceiling` at once.
    OnDemand {
        /// Maximum number of simultaneously allocated buffers
        ceiling: usize,
    },
}

/// Everything needed to build one pool.
#[derive(Debug, Clone)]
pub struct PoolSpec {
    /// Name used in logs and errors, usually the tag rendered as text.
    pub name: String,
    /// Allocation policy.
    pub kind: PoolKind,
    /// Buffers allocated at construction (the whole pool for `Fixed`).
    pub count: usize,
    /// Shape of every buffer.
    pub layout: BufferLayout,
}

impl PoolSpec {
    /// Fixed pool of `count` buffers.
    #[must_use]
    pub fn fixed(name: impl Into<String>, count: usize, layout: BufferLayout) -> Self {
        Self {
            name: name.into(),
            kind: PoolKind::Fixed,
            count,
            layout,
        }
    }

    /// On-demand pool that starts empty and grows up to `ceiling`.
    #[must_use]
    pub fn on_demand(name: impl Into<String>, ceiling: usize, layout: BufferLayout) -> Self {
        Self {
            name: name.into(),
            kind: PoolKind::OnDemand { ceiling },
            count: 0,
            layout,
        }
    }

    fn validate(&self) -> Result<(), PoolError> {
        self.layout.validate()?;
        match self.kind {
            PoolKind::Fixed if self.count == 0 => Err(PoolError::InvalidSpec(format!(
                "fixed pool '{}' needs at least one buffer",
                self.name
            ))),
            PoolKind::OnDemand { ceiling } if ceiling == 0 || self.count > ceiling => {
                Err(PoolError::InvalidSpec(format!(
                    "on-demand pool '{}' has ceiling {} and initial count {}",
                    self.name, ceiling, self.count
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Pool name
    pub name: String,
    /// Buffers currently allocated (free + handed out)
    pub allocated: usize,
    /// Buffers in the free queue
    pub available: usize,
    /// Buffers handed out and not yet returned, including fence-deferred ones
    pub outstanding: usize,
    /// Releases waiting for a fence
    pub pending_release: usize,
    /// Total acquires since creation
    pub total_acquires: u64,
    /// Total returns since creation
    pub total_returns: u64,
}

struct BufferPoolInner {
    name: String,
    kind: PoolKind,
    layout: BufferLayout,
    allocator: Arc<dyn Allocator>,
    /// Lock-free queue of free buffers
    free_buffers: SegQueue<BufferStorage>,
    /// Permits track free buffers
    semaphore: Semaphore,
    allocated: AtomicUsize,
    available: AtomicUsize,
    pending_release: AtomicUsize,
    /// Indices currently owned outside the pool
    outstanding: Mutex<HashSet<u32>>,
    next_index: AtomicU32,
    /// Woken on every return
    returned: Notify,
    total_acquires: AtomicU64,
    total_returns: AtomicU64,
}

impl BufferPoolInner {
    fn checkout(self: &Arc<Self>, storage: BufferStorage) -> Buffer {
        let index = storage.index;
        if !self.outstanding.lock().insert(index) {
            error!(pool = %self.name, index, "Buffer handed out while already owned");
        }
        self.total_acquires.fetch_add(1, Ordering::Relaxed);
        let plane_count = storage.planes.len();
        Buffer {
            index,
            storage: Some(storage),
            bytes_used: vec![0; plane_count],
            acquire_fence: None,
            release_fence: None,
            batch_index: 0,
            pool: Arc::clone(self),
        }
    }

    fn take_free(self: &Arc<Self>) -> Option<Buffer> {
        let permit = self.semaphore.try_acquire().ok()?;
        let storage = self.free_buffers.pop()?;
        permit.forget();
        self.available.fetch_sub(1, Ordering::Relaxed);
        Some(self.checkout(storage))
    }

    fn grow(self: &Arc<Self>) -> Result<Buffer, PoolError> {
        let PoolKind::OnDemand { ceiling } = self.kind else {
            return Err(self.exhausted());
        };
        let reserved = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < ceiling).then_some(current + 1)
            });
        if reserved.is_err() {
            return Err(self.exhausted());
        }

        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        match self.allocator.allocate(&self.layout, index) {
            Ok(storage) => {
                debug!(pool = %self.name, index, ceiling, "On-demand buffer allocated");
                Ok(self.checkout(storage))
            }
            Err(e) => {
                self.allocated.fetch_sub(1, Ordering::AcqRel);
                warn!(pool = %self.name, error = %e, "On-demand allocation failed");
                Err(e)
            }
        }
    }

    fn exhausted(&self) -> PoolError {
        PoolError::Exhausted {
            pool: self.name.clone(),
            allocated: self.allocated.load(Ordering::Acquire),
        }
    }

    fn reclaim(self: &Arc<Self>, storage: BufferStorage, fence: Option<Fence>) {
        match fence {
            Some(fence) if !fence.is_signalled() => {
                self.pending_release.fetch_add(1, Ordering::AcqRel);
                debug!(pool = %self.name, index = storage.index, "Release deferred until fence signals");
                let pool = Arc::clone(self);
                fence.on_signal(move || {
                    pool.pending_release.fetch_sub(1, Ordering::AcqRel);
                    pool.return_storage(storage);
                });
            }
            _ => self.return_storage(storage),
        }
    }

    fn return_storage(&self, mut storage: BufferStorage) {
        if !self.outstanding.lock().remove(&storage.index) {
            error!(pool = %self.name, index = storage.index, "Buffer returned twice, dropping duplicate");
            return;
        }
        if let Some(meta) = storage.metadata.as_mut() {
            meta.fill(0);
        }
        self.free_buffers.push(storage);
        self.available.fetch_add(1, Ordering::Relaxed);
        self.total_returns.fetch_add(1, Ordering::Relaxed);
        self.semaphore.add_permits(1);
        self.returned.notify_waiters();
    }

    fn is_fully_reclaimed(&self) -> bool {
        self.outstanding.lock().is_empty() && self.pending_release.load(Ordering::Acquire) == 0
    }
}

/// Pool of buffers for one (stage, role) tag.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl BufferPool {
    /// Builds a pool, allocating `spec.count` buffers from `allocator` up front.
    pub fn new(spec: PoolSpec, allocator: Arc<dyn Allocator>) -> Result<Self, PoolError> {
        spec.validate()?;

        let free_buffers = SegQueue::new();
        for index in 0..spec.count {
            let index = u32::try_from(index)
                .map_err(|_| PoolError::InvalidSpec(format!("pool '{}' too large", spec.name)))?;
            free_buffers.push(allocator.allocate(&spec.layout, index)?);
        }

        info!(
            pool = %spec.name,
            kind = ?spec.kind,
            count = spec.count,
            buffer_bytes = spec.layout.total_bytes(),
            allocator = allocator.name(),
            "BufferPool created"
        );

        Ok(Self {
            inner: Arc::new(BufferPoolInner {
                semaphore: Semaphore::new(spec.count),
                allocated: AtomicUsize::new(spec.count),
                available: AtomicUsize::new(spec.count),
                pending_release: AtomicUsize::new(0),
                outstanding: Mutex::new(HashSet::new()),
                next_index: AtomicU32::new(u32::try_from(spec.count).unwrap_or(u32::MAX)),
                returned: Notify::new(),
                total_acquires: AtomicU64::new(0),
                total_returns: AtomicU64::new(0),
                free_buffers,
                name: spec.name,
                kind: spec.kind,
                layout: spec.layout,
                allocator,
            }),
        })
    }

    /// Builds a pool backed by [`HeapAllocator`].
    pub fn with_heap(spec: PoolSpec) -> Result<Self, PoolError> {
        Self::new(spec, Arc::new(HeapAllocator))
    }

    /// Takes a free buffer without waiting.
    ///
    /// On-demand pools allocate when the free queue is empty and the ceiling allows it.
    /// An empty fixed pool is a sizing bug and is logged at error level.
    pub fn try_acquire(&self) -> Result<Buffer, PoolError> {
        if let Some(buffer) = self.inner.take_free() {
            return Ok(buffer);
        }
        match self.inner.kind {
            PoolKind::OnDemand { .. } => self.inner.grow(),
            PoolKind::Fixed => {
                let err = self.inner.exhausted();
                error!(pool = %self.inner.name, error = %err, "Fixed pool exhausted");
                Err(err)
            }
        }
    }

    /// Acquires a buffer, waiting up to `timeout` for one to be returned.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Buffer, PoolError> {
        if let Some(buffer) = self.inner.take_free() {
            return Ok(buffer);
        }
        if let PoolKind::OnDemand { .. } = self.inner.kind {
            match self.inner.grow() {
                Ok(buffer) => return Ok(buffer),
                Err(PoolError::Exhausted { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let timed_out = || PoolError::Timeout {
            pool: self.inner.name.clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let permit = match tokio::time::timeout(timeout, self.inner.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                warn!(pool = %self.inner.name, ?timeout, "Timed out waiting for a free buffer");
                return Err(timed_out());
            }
        };
        let Some(storage) = self.inner.free_buffers.pop() else {
            return Err(timed_out());
        };
        permit.forget();
        self.inner.available.fetch_sub(1, Ordering::Relaxed);
        Ok(self.inner.checkout(storage))
    }

    /// Returns `buffer` to this pool.
    ///
    /// A buffer from another pool is still returned to its own pool, and the mismatch is reported.
    pub fn release(&self, buffer: Buffer) -> Result<(), PoolError> {
        if !buffer.belongs_to(self) {
            let err = PoolError::ForeignBuffer {
                pool: self.inner.name.clone(),
                index: buffer.index(),
            };
            warn!(error = %err, "Release to wrong pool");
            drop(buffer);
            return Err(err);
        }
        drop(buffer);
        Ok(())
    }

    /// Frees idle buffers of an on-demand pool. Returns how many were freed.
    pub fn trim(&self) -> usize {
        if self.inner.kind == PoolKind::Fixed {
            return 0;
        }
        let mut freed = 0;
        while let Ok(permit) = self.inner.semaphore.try_acquire() {
            let Some(storage) = self.inner.free_buffers.pop() else {
                break;
            };
            permit.forget();
            self.inner.available.fetch_sub(1, Ordering::Relaxed);
            self.inner.allocated.fetch_sub(1, Ordering::AcqRel);
            self.inner.allocator.free(storage);
            freed += 1;
        }
        if freed > 0 {
            debug!(pool = %self.inner.name, freed, "On-demand pool trimmed");
        }
        freed
    }

    /// Waits until every handed-out buffer has come back, up to `timeout`.
    pub async fn wait_reclaimed(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.returned.notified();
                if self.inner.is_fully_reclaimed() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Allocation policy.
    #[must_use]
    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    /// Buffer layout.
    #[must_use]
    pub fn layout(&self) -> &BufferLayout {
        &self.inner.layout
    }

    /// Free buffers right now.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    /// Buffers currently allocated.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    /// Buffers owned outside the pool.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.lock().len()
    }

    /// Releases queued behind unsignalled fences.
    #[must_use]
    pub fn pending_releases(&self) -> usize {
        self.inner.pending_release.load(Ordering::Acquire)
    }

    /// True when nothing is handed out and no release is pending.
    #[must_use]
    pub fn is_fully_reclaimed(&self) -> bool {
        self.inner.is_fully_reclaimed()
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.inner.name.clone(),
            allocated: self.allocated(),
            available: self.available(),
            outstanding: self.outstanding(),
            pending_release: self.pending_releases(),
            total_acquires: self.inner.total_acquires.load(Ordering::Relaxed),
            total_returns: self.inner.total_returns.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("available", &self.available())
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// Move-only handle to one pooled buffer.
///
/// Dropping the handle is the release; there is no way to touch the memory afterwards.
pub struct Buffer {
    index: u32,
    storage: Option<BufferStorage>,
    bytes_used: Vec<usize>,
    acquire_fence: Option<Fence>,
    release_fence: Option<Fence>,
    batch_index: u32,
    pool: Arc<BufferPoolInner>,
}

impl Buffer {
    /// Pool-assigned index.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Name of the owning pool.
    #[must_use]
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Whether this buffer was handed out by `pool`.
    #[must_use]
    pub fn belongs_to(&self, pool: &BufferPool) -> bool {
        Arc::ptr_eq(&self.pool, &pool.inner)
    }

    /// Number of image planes.
    #[must_use]
    pub fn plane_count(&self) -> usize {
        self.bytes_used.len()
    }

    /// Plane contents (full capacity).
    #[must_use]
    pub fn plane(&self, plane: usize) -> Option<&[u8]> {
        self.storage
            .as_ref()
            .and_then(|s| s.planes.get(plane))
            .map(Vec::as_slice)
    }

    /// Mutable plane contents (full capacity).
    pub fn plane_mut(&mut self, plane: usize) -> Option<&mut [u8]> {
        self.storage
            .as_mut()
            .and_then(|s| s.planes.get_mut(plane))
            .map(Vec::as_mut_slice)
    }

    /// Capacity of a plane in bytes.
    #[must_use]
    pub fn plane_size(&self, plane: usize) -> usize {
        self.plane(plane).map_or(0, <[u8]>::len)
    }

    /// Bytes written to a plane by the last producer.
    #[must_use]
    pub fn bytes_used(&self, plane: usize) -> usize {
        self.bytes_used.get(plane).copied().unwrap_or(0)
    }

    /// Records how many bytes of `plane` hold valid data, clamped to capacity.
    pub fn set_bytes_used(&mut self, plane: usize, bytes: usize) {
        let capacity = self.plane_size(plane);
        if let Some(used) = self.bytes_used.get_mut(plane) {
            *used = bytes.min(capacity);
        }
    }

    /// Metadata plane, if the layout has one.
    #[must_use]
    pub fn metadata_plane(&self) -> Option<&[u8]> {
        self.storage
            .as_ref()
            .and_then(|s| s.metadata.as_deref())
    }

    /// Mutable metadata plane.
    pub fn metadata_plane_mut(&mut self) -> Option<&mut [u8]> {
        self.storage
            .as_mut()
            .and_then(|s| s.metadata.as_deref_mut())
    }

    /// Sub-frame index within a hardware batch.
    #[must_use]
    pub fn batch_index(&self) -> u32 {
        self.batch_index
    }

    /// Sets the batch sub-index. Returns `false` if it is outside the pool's batch size.
    pub fn set_batch_index(&mut self, batch_index: u32) -> bool {
        if batch_index >= self.pool.layout.batch_size {
            return false;
        }
        self.batch_index = batch_index;
        true
    }

    /// Fence the producer signals once the buffer may be written.
    #[must_use]
    pub fn acquire_fence(&self) -> Option<&Fence> {
        self.acquire_fence.as_ref()
    }

    /// Attaches an acquire fence.
    pub fn set_acquire_fence(&mut self, fence: Fence) {
        self.acquire_fence = Some(fence);
    }

    /// Detaches the acquire fence.
    pub fn take_acquire_fence(&mut self) -> Option<Fence> {
        self.acquire_fence.take()
    }

    /// Attaches a release fence. The return to the pool waits for it.
    pub fn set_release_fence(&mut self, fence: Fence) {
        self.release_fence = Some(fence);
    }

    /// Returns the buffer to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            let fence = self.release_fence.take();
            self.pool.reclaim(storage, fence);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("pool", &self.pool.name)
            .field("index", &self.index)
            .field("batch_index", &self.batch_index)
            .finish()
    }
}
