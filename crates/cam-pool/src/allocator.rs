//! Allocation backends.
//!
//! Physical (DMA / ION) allocation is owned by the platform. Pools only see the
//! [`Allocator`] trait, so tests and the simulator run against plain heap memory.

use crate::PoolError;

/// Shape of every buffer in one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLayout {
    /// Size in bytes of each image plane.
    pub plane_sizes: Vec<usize>,
    /// Size of the trailing metadata plane, 0 when absent.
    pub metadata_plane: usize,
    /// Number of sub-frames transferred per hardware batch.
    pub batch_size: u32,
}

impl BufferLayout {
    /// Single plane of `bytes`, no metadata plane, batch size 1.
    #[must_use]
    pub fn single_plane(bytes: usize) -> Self {
        Self::with_planes(vec![bytes])
    }

    /// Multiple image planes, no metadata plane, batch size 1.
    #[must_use]
    pub fn with_planes(plane_sizes: Vec<usize>) -> Self {
        Self {
            plane_sizes,
            metadata_plane: 0,
            batch_size: 1,
        }
    }

    /// Adds a metadata plane of `bytes`.
    #[must_use]
    pub fn metadata(mut self, bytes: usize) -> Self {
        self.metadata_plane = bytes;
        self
    }

    /// Sets the batch size used for burst transfers.
    #[must_use]
    pub fn batch(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Total bytes per buffer across all planes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.plane_sizes.iter().sum::<usize>() + self.metadata_plane
    }

    pub(crate) fn validate(&self) -> Result<(), PoolError> {
        if self.plane_sizes.is_empty() {
            return Err(PoolError::InvalidSpec("layout has no planes".into()));
        }
        if self.plane_sizes.iter().any(|&size| size == 0) {
            return Err(PoolError::InvalidSpec("layout has an empty plane".into()));
        }
        if self.batch_size == 0 {
            return Err(PoolError::InvalidSpec("batch size must be > 0".into()));
        }
        Ok(())
    }
}

/// Memory backing one buffer.
#[derive(Debug)]
pub struct BufferStorage {
    pub(crate) index: u32,
    pub(crate) planes: Vec<Vec<u8>>,
    pub(crate) metadata: Option<Vec<u8>>,
}

impl BufferStorage {
    /// Wraps backend memory. `index` is assigned by the pool.
    #[must_use]
    pub fn new(index: u32, planes: Vec<Vec<u8>>, metadata: Option<Vec<u8>>) -> Self {
        Self {
            index,
            planes,
            metadata,
        }
    }

    /// Pool-assigned index.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Allocation backend used by pools to create and free buffer memory.
pub trait Allocator: Send + Sync + std::fmt::Debug {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Allocates memory for one buffer with `layout`.
    fn allocate(&self, layout: &BufferLayout, index: u32) -> Result<BufferStorage, PoolError>;

    /// Frees memory previously returned by [`Allocator::allocate`].
    fn free(&self, storage: BufferStorage) {
        drop(storage);
    }
}

/// Plain heap allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn name(&self) -> &str {
        "heap"
    }

    fn allocate(&self, layout: &BufferLayout, index: u32) -> Result<BufferStorage, PoolError> {
        let planes = layout
            .plane_sizes
            .iter()
            .map(|&size| vec![0u8; size])
            .collect();
        let metadata = (layout.metadata_plane > 0).then(|| vec![0u8; layout.metadata_plane]);
        Ok(BufferStorage::new(index, planes, metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocates_every_plane() {
        let layout = BufferLayout::with_planes(vec![16, 8]).metadata(4);
        let storage = HeapAllocator.allocate(&layout, 3).unwrap();
        assert_eq!(storage.index(), 3);
        assert_eq!(storage.planes.len(), 2);
        assert_eq!(storage.planes[1].len(), 8);
        assert_eq!(storage.metadata.as_ref().map(Vec::len), Some(4));
        assert_eq!(layout.total_bytes(), 28);
    }

    #[test]
    fn layout_validation() {
        assert!(BufferLayout::single_plane(64).validate().is_ok());
        assert!(BufferLayout::with_planes(vec![]).validate().is_err());
        assert!(BufferLayout::with_planes(vec![4, 0]).validate().is_err());
        assert!(BufferLayout::single_plane(4).batch(0).validate().is_err());
    }
}
