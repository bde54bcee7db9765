//! Copy-on-write interception of dirty writes to shared data blocks.

use block_io::{BlockData, BlockDevice, BufferList};
use dedupfs_types::{BLOCK_SIZE, IndexBlock};
use mutex_api::Mutex;

use crate::{allocator::Allocator, error::Error, fs::FileSystem, inode::Inode};

impl<Device, BufferListMutex, BlockDataMutex, RegistryMutex, A>
    FileSystem<Device, BufferListMutex, BlockDataMutex, RegistryMutex, A>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
    A: Allocator,
{
    /// Intercepts a dirty write to logical blocks `[start_logical,
    /// start_logical + count)` of `inode`, copying any shared block to a
    /// fresh one before the caller is allowed to write in place.
    ///
    /// The allocation-and-link of the replacement block always precedes
    /// the unlink of the old one, so no live block is ever observed with
    /// `nlink = 0` across a crash mid-loop. On `ENOSPC` or `IO`, blocks
    /// already COW-ed earlier in the range stay COW-ed; the index block is
    /// flushed with whatever progress was made before the error surfaces.
    pub fn cow<I>(
        &self,
        inode: &I,
        start_logical: u32,
        count: u32,
    ) -> Result<(), Error<Device::Error>>
    where
        I: Inode,
    {
        let mut index_handle = self.cache.get(inode.index_block().as_index());
        let mut index_guard = index_handle.lock().read().map_err(|(_, e)| e)?;
        let mut any_dirty = false;

        let outcome = 'cow: {
            for k in start_logical..start_logical.saturating_add(count) {
                let k = k as usize;

                let bno = match index_guard.data::<IndexBlock>().get(k) {
                    Some(bno) => bno,
                    None => break 'cow Err(Error::Corrupt("cow on unallocated index entry")),
                };

                match self.block_nlink(bno) {
                    Ok(1) => continue,
                    Ok(_) => {}
                    Err(e) => break 'cow Err(e),
                }

                let new_bno = match self.allocator.alloc_block() {
                    Some(bno) => bno,
                    None => break 'cow Err(Error::NoSpace),
                };
                if let Err(e) = self.link_block(new_bno) {
                    break 'cow Err(e);
                }

                let mut old_bytes = [0u8; BLOCK_SIZE];
                {
                    let mut old_handle = self.cache.get(bno.as_index());
                    match old_handle.lock().read() {
                        Ok(old_guard) => old_bytes.copy_from_slice(old_guard.bytes()),
                        Err((_, e)) => break 'cow Err(e.into()),
                    }
                }

                {
                    let mut new_handle = self.cache.get(new_bno.as_index());
                    let mut new_guard = new_handle.lock().zeroed();
                    new_guard.bytes_mut().copy_from_slice(&old_bytes);
                    new_guard.write_back();
                }

                if let Err(e) = self.unlink_block(bno) {
                    break 'cow Err(e);
                }

                index_guard.data_mut::<IndexBlock>().set(k, Some(new_bno));
                any_dirty = true;
            }
            Ok(())
        };

        if any_dirty {
            index_guard.write_back();
        }
        outcome
    }
}
