//! Buffer pools for the capture pipeline.
//!
//! Every hardware buffer that moves through the pipeline is owned by exactly one party at a
//! time: its pool, a stage slot of an in-flight frame, or the external caller. This crate
//! models that rule with a move-only [`Buffer`] handle:
//!
//! ```text
//! BufferPool ──try_acquire()──▶ Buffer ──moved into frame slot──▶ ... ──drop / release()──▶ BufferPool
//!                                   │
//!                                   └── release fence pending? ──▶ queued until Fence::signal()
//! ```
//!
//! - [`BufferPool`] - one pool per (stage, role) tag, fixed or on-demand
//! - [`Buffer`] - move-only handle, returns itself to the pool on drop
//! - [`Fence`] - acquire/release synchronization primitive
//! - [`PoolSet`] - keyed registry of pools
//! - [`Allocator`] - allocation backend, [`HeapAllocator`] by default

pub mod allocator;
pub mod buffer_pool;
pub mod fence;
pub mod pool_set;

pub use allocator::{Allocator, BufferLayout, BufferStorage, HeapAllocator};
pub use buffer_pool::{Buffer, BufferPool, PoolKind, PoolSpec, PoolStats};
pub use fence::Fence;
pub use pool_set::PoolSet;

use thiserror::Error;

/// Errors reported by buffer pools.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No free buffer and the pool cannot grow.
    #[error("Pool '{pool}' exhausted ({allocated} buffers allocated)")]
    Exhausted {
        /// Pool name
        pool: String,
        /// Buffers currently allocated by the pool
        allocated: usize,
    },
    /// A bounded wait for a free buffer expired.
    #[error("Pool '{pool}' timed out after {timeout_ms} ms waiting for a buffer")]
    Timeout {
        /// Pool name
        pool: String,
        /// Wait budget that expired
        timeout_ms: u64,
    },
    /// The allocation backend refused to allocate.
    #[error("Pool '{pool}' allocation failed: {reason}")]
    AllocationFailed {
        /// Pool name
        pool: String,
        /// Backend-provided reason
        reason: String,
    },
    /// Pool specification is unusable.
    #[error("Invalid pool specification: {0}")]
    InvalidSpec(String),
    /// No pool registered for the tag.
    #[error("No pool registered for tag '{0}'")]
    UnknownPool(String),
    /// A pool is already registered for the tag.
    #[error("Pool '{0}' is already registered")]
    DuplicatePool(String),
    /// Buffer was released to a pool that did not hand it out.
    #[error("Buffer {index} does not belong to pool '{pool}'")]
    ForeignBuffer {
        /// Pool the release was attempted on
        pool: String,
        /// Index of the foreign buffer
        index: u32,
    },
}
