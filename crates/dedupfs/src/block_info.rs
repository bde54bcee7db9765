//! Block-Info Store: one 32-bit reference count per data block.

use block_io::{BlockData, BlockDevice, BufferList};
use dedupfs_types::{BLOCK_SIZE, BisBlock, BlockNo};
use mutex_api::Mutex;

use crate::{allocator::Allocator, error::Error, fs::FileSystem};

impl<Device, BufferListMutex, BlockDataMutex, RegistryMutex, A>
    FileSystem<Device, BufferListMutex, BlockDataMutex, RegistryMutex, A>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
    A: Allocator,
{
    /// Reads the current reference count of `bno`.
    pub fn block_nlink(&self, bno: BlockNo) -> Result<u32, Error<Device::Error>> {
        let (bis_block, offset) = self
            .super_block
            .bis_location(bno)
            .ok_or(Error::Corrupt("block number outside data range"))?;
        let mut handle = self.cache.get(bis_block.as_index());
        let guard = handle.lock().read().map_err(|(_, e)| e)?;
        Ok(guard.data::<BisBlock>().record(offset).nlink)
    }

    /// Increments `bno`'s reference count.
    ///
    /// If the block was already live (`nlink >= 1`), this is a share event:
    /// one more notional free block is charged against the free-block
    /// count. Marks the BIS buffer dirty; does not sync it.
    pub fn link_block(&self, bno: BlockNo) -> Result<(), Error<Device::Error>> {
        let (bis_block, offset) = self
            .super_block
            .bis_location(bno)
            .ok_or(Error::Corrupt("block number outside data range"))?;
        let mut handle = self.cache.get(bis_block.as_index());
        let mut guard = handle.lock().read().map_err(|(_, e)| e)?;

        let record = guard.data_mut::<BisBlock>().record_mut(offset);
        let n = record.nlink;
        record.nlink = n + 1;
        guard.write_back();

        if n >= 1 {
            self.allocator.adjust_free_count(-1);
        }
        Ok(())
    }

    /// Decrements `bno`'s reference count and returns the new value.
    ///
    /// If the count reaches zero, the block is returned to the free-block
    /// bitmap. Otherwise the free-block count is incremented to mirror
    /// [`Self::link_block`]'s decrement. Marks the BIS buffer dirty.
    pub fn unlink_block(&self, bno: BlockNo) -> Result<u32, Error<Device::Error>> {
        let (bis_block, offset) = self
            .super_block
            .bis_location(bno)
            .ok_or(Error::Corrupt("block number outside data range"))?;
        let mut handle = self.cache.get(bis_block.as_index());
        let mut guard = handle.lock().read().map_err(|(_, e)| e)?;

        let record = guard.data_mut::<BisBlock>().record_mut(offset);
        let n = if record.nlink > 0 {
            record.nlink -= 1;
            record.nlink
        } else {
            log::warn!("unlink_block({bno}): refcount already zero");
            0
        };
        guard.write_back();

        if n == 0 {
            self.allocator.free_block(bno);
        } else {
            self.allocator.adjust_free_count(1);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use dedupfs_types::SuperBlock;

    use super::*;
    use crate::test_support::{MemAllocator, MemDevice, TestFs};

    fn fixture() -> TestFs {
        let sb = SuperBlock {
            nr_blocks: 64,
            nr_istore: 2,
            nr_ifree: 1,
            nr_bfree: 1,
            nr_bstore: 2,
            index_dupblock: 1,
        };
        let device = MemDevice::new(64);
        FileSystem::new(device, 16, sb, MemAllocator::new(64))
    }

    #[test]
    fn link_then_unlink_round_trips_to_zero() {
        let fs = fixture();
        let bno = BlockNo::new(fs.super_block().first_data().value());

        let free_count_before = *fs.allocator().free_count.lock();

        fs.link_block(bno).unwrap(); // first reference: no share charge
        assert_eq!(fs.block_nlink(bno).unwrap(), 1);
        assert_eq!(*fs.allocator().free_count.lock(), free_count_before);

        fs.link_block(bno).unwrap(); // second reference: share event
        assert_eq!(fs.block_nlink(bno).unwrap(), 2);
        assert_eq!(*fs.allocator().free_count.lock(), free_count_before - 1);

        assert_eq!(fs.unlink_block(bno).unwrap(), 1);
        assert_eq!(*fs.allocator().free_count.lock(), free_count_before);
        assert_eq!(fs.unlink_block(bno).unwrap(), 0);
        assert!(fs.allocator().freed.lock().contains(&bno));
    }

    #[test]
    fn block_outside_data_range_is_corrupt() {
        let fs = fixture();
        let err = fs.link_block(BlockNo::new(0)).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
