//! Dedup Candidate Registry: lazily-populated `sources`/`duplicated` lists.

extern crate alloc;

use alloc::vec::Vec;

use block_io::{BlockData, BlockDevice, BufferList};
use dedupfs_types::{BLOCK_SIZE, CandidateList, DedupCandidateBlock};
use mutex_api::Mutex;

use crate::{allocator::Allocator, bitset::InodeBitset, error::Error, fs::FileSystem, inode::Inode};

/// The in-memory half of the registry: bitmaps suppressing repeat list
/// insertions. Volatile by design (see the data-model lifecycle note);
/// reconstructed empty at mount.
pub struct DedupRegistry<RegistryMutex> {
    isrc_bitmap: InodeBitset<RegistryMutex>,
    idup_bitmap: InodeBitset<RegistryMutex>,
}

impl<RegistryMutex> DedupRegistry<RegistryMutex>
where
    RegistryMutex: Mutex<Data = Vec<u64>>,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            isrc_bitmap: InodeBitset::new(),
            idup_bitmap: InodeBitset::new(),
        }
    }
}

impl<RegistryMutex> Default for DedupRegistry<RegistryMutex>
where
    RegistryMutex: Mutex<Data = Vec<u64>>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Device, BufferListMutex, BlockDataMutex, RegistryMutex, A>
    FileSystem<Device, BufferListMutex, BlockDataMutex, RegistryMutex, A>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
    RegistryMutex: Mutex<Data = Vec<u64>>,
    A: Allocator,
{
    /// Records `inode` as a dedup source candidate (called from the read
    /// path). No-ops if the inode is already tracked or the on-disk list
    /// is full.
    pub fn mark_source<I>(&self, inode: &I) -> Result<(), Error<Device::Error>>
    where
        I: Inode,
    {
        self.mark(inode, CandidateList::Sources)
    }

    /// Records `inode` as a dedup duplicated-writer candidate (called from
    /// the writeback path).
    pub fn mark_duplicated<I>(&self, inode: &I) -> Result<(), Error<Device::Error>>
    where
        I: Inode,
    {
        self.mark(inode, CandidateList::Duplicated)
    }

    fn mark<I>(&self, inode: &I, which: CandidateList) -> Result<(), Error<Device::Error>>
    where
        I: Inode,
    {
        let bitmap = match which {
            CandidateList::Sources => &self.registry.isrc_bitmap,
            CandidateList::Duplicated => &self.registry.idup_bitmap,
        };
        if bitmap.test_and_set(inode.ino()) {
            return Ok(());
        }

        let mut handle = self.cache.get(self.super_block.dup_block().as_index());
        let mut guard = handle.lock().read().map_err(|(_, e)| e)?;
        if guard.data_mut::<DedupCandidateBlock>().push(which, inode.ino()) {
            guard.write_back();
        }
        Ok(())
    }

    /// Clears both on-disk lists and their in-memory bitmaps, as happens
    /// after a successful [`Self::deduplicate`] pass.
    pub(crate) fn clear_dup_block(&self) -> Result<(), Error<Device::Error>> {
        let mut handle = self.cache.get(self.super_block.dup_block().as_index());
        let mut guard = handle.lock().read().map_err(|(_, e)| e)?;
        guard.data_mut::<DedupCandidateBlock>().clear();
        guard.sync()?;
        self.registry.isrc_bitmap.clear();
        self.registry.idup_bitmap.clear();
        Ok(())
    }
}
