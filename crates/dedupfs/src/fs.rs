//! Ties the buffer cache, allocator, and in-memory registry state together.

use block_io::{BlockData, BlockDevice, BlockIoCache, BufferList};
use dedupfs_types::{BLOCK_SIZE, SuperBlock};
use mutex_api::Mutex;

use crate::{allocator::Allocator, dedup_registry::DedupRegistry};

/// The block-sharing subsystem's view of a mounted filesystem.
///
/// Generic over the block device, the buffer-cache locks (same split as
/// [`block_io::BlockIoCache`]), the lock protecting the in-memory dedup
/// bitmaps, and the free-block allocator. Everything else this crate
/// covers — BIS, COW, the dedup registry, the offline deduplicator — is
/// implemented as methods on this type, split across modules by concern.
pub struct FileSystem<Device, BufferListMutex, BlockDataMutex, RegistryMutex, A> {
    pub(crate) cache: BlockIoCache<Device, BufferListMutex>,
    pub(crate) super_block: SuperBlock,
    pub(crate) allocator: A,
    pub(crate) registry: DedupRegistry<RegistryMutex>,
    _block_data: core::marker::PhantomData<fn() -> BlockDataMutex>,
}

impl<Device, BufferListMutex, BlockDataMutex, RegistryMutex, A>
    FileSystem<Device, BufferListMutex, BlockDataMutex, RegistryMutex, A>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
    RegistryMutex: Mutex<Data = alloc::vec::Vec<u64>>,
    A: Allocator,
{
    /// Wraps an already-initialized device and superblock.
    ///
    /// `cache_blocks` sizes the in-memory buffer cache; it bounds how many
    /// distinct blocks can be pinned at once. COW needs at least three live
    /// at a time (index, old data, new data); BIS updates need a fourth.
    pub fn new(device: Device, cache_blocks: usize, super_block: SuperBlock, allocator: A) -> Self {
        let cache = BlockIoCache::new(device);
        cache.init(cache_blocks);
        Self {
            cache,
            super_block,
            allocator,
            registry: DedupRegistry::new(),
            _block_data: core::marker::PhantomData,
        }
    }

    #[must_use]
    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Flushes every dirty buffer. Intended to be called as part of an
    /// unmount sequence, alongside [`Self::deduplicate`].
    pub fn sync_all(&self) -> Result<(), Device::Error> {
        self.cache.sync_all()
    }
}
