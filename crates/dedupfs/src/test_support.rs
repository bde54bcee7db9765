//! Shared fixtures for the unit tests in [`crate::block_info`], [`crate::cow`],
//! [`crate::dedup_registry`], and [`crate::dedup`].

extern crate std;

use std::{collections::VecDeque, convert::Infallible, vec::Vec};

use block_io::{BlockData, BlockDevice, BufferList};
use dedupfs_types::{BLOCK_SIZE, BlockNo, InodeNo};
use mutex_api::StdMutex;

use crate::{allocator::Allocator, fs::FileSystem, inode::Inode};

pub(crate) type TestFs = FileSystem<
    MemDevice,
    StdMutex<BufferList<StdMutex<BlockData<BLOCK_SIZE>>>>,
    StdMutex<BlockData<BLOCK_SIZE>>,
    StdMutex<std::vec::Vec<u64>>,
    MemAllocator,
>;

#[derive(Clone)]
pub(crate) struct MemDevice {
    blocks: std::sync::Arc<Vec<StdMutex<[u8; BLOCK_SIZE]>>>,
}

impl MemDevice {
    pub(crate) fn new(num_blocks: usize) -> Self {
        Self {
            blocks: std::sync::Arc::new((0..num_blocks).map(|_| StdMutex::new([0; BLOCK_SIZE])).collect()),
        }
    }
}

impl BlockDevice<BLOCK_SIZE> for MemDevice {
    type Error = Infallible;

    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        data.copy_from_slice(&*self.blocks[index].lock());
        Ok(())
    }

    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        self.blocks[index].lock().copy_from_slice(data);
        Ok(())
    }
}

/// An in-memory free-block allocator: hands out a fixed pool of block
/// numbers reserved above the fixtures' data blocks, and records frees and
/// `nr_free_blocks` adjustments for assertions.
pub(crate) struct MemAllocator {
    free: StdMutex<VecDeque<BlockNo>>,
    pub(crate) free_count: StdMutex<i64>,
    pub(crate) freed: StdMutex<Vec<BlockNo>>,
}

impl MemAllocator {
    /// `pool_size` fresh block numbers, starting at block 20 so they never
    /// collide with the low block numbers the fixtures wire up by hand.
    pub(crate) fn new(pool_size: u32) -> Self {
        let free = (0..pool_size).map(|i| BlockNo::new(20 + i)).collect();
        Self {
            free: StdMutex::new(free),
            free_count: StdMutex::new(i64::from(pool_size)),
            freed: StdMutex::new(Vec::new()),
        }
    }
}

impl Allocator for MemAllocator {
    fn alloc_block(&self) -> Option<BlockNo> {
        self.free.lock().pop_front()
    }

    fn free_block(&self, bno: BlockNo) {
        self.freed.lock().push(bno);
    }

    fn adjust_free_count(&self, delta: i32) {
        *self.free_count.lock() += i64::from(delta);
    }
}

#[derive(Clone, Copy)]
pub(crate) struct FixtureInode {
    pub(crate) ino: InodeNo,
    pub(crate) index_block: BlockNo,
    pub(crate) size: u64,
    pub(crate) block_count: u32,
}

impl Inode for FixtureInode {
    fn ino(&self) -> InodeNo {
        self.ino
    }

    fn index_block(&self) -> BlockNo {
        self.index_block
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }
}
