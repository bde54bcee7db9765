//! Offline Deduplicator: collapses byte-identical blocks at unmount.

extern crate alloc;

use alloc::vec::Vec;

use block_io::{BlockData, BlockDevice, BufferList};
use dedupfs_types::{BLOCK_SIZE, BlockNo, CandidateList, DedupCandidateBlock, IndexBlock, InodeNo};
use mutex_api::Mutex;

use crate::{allocator::Allocator, error::Error, fs::FileSystem, inode::Inode};

impl<Device, BufferListMutex, BlockDataMutex, RegistryMutex, A>
    FileSystem<Device, BufferListMutex, BlockDataMutex, RegistryMutex, A>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
    RegistryMutex: Mutex<Data = Vec<u64>>,
    A: Allocator,
{
    /// Collapses `dup`'s blocks that are byte-identical to one of `src`'s,
    /// in index order. `src` is read-only throughout; only `dup`'s index
    /// block (and the BIS records of the blocks that change hands) are
    /// mutated. Returns the number of blocks collapsed.
    ///
    /// A read failure aborts this pair only: whatever collapses already
    /// landed stay durable, and the error propagates to the caller.
    pub fn dedup_file<Src, Dup>(&self, src: &Src, dup: &Dup) -> Result<i32, Error<Device::Error>>
    where
        Src: Inode,
        Dup: Inode,
    {
        let last_logical = usize::try_from(src.size() / BLOCK_SIZE as u64).unwrap_or(usize::MAX);
        let src_data_blocks = src.block_count().saturating_sub(1) as usize;
        let dup_data_blocks = dup.block_count().saturating_sub(1) as usize;

        // `src` and `dup` may be the same inode (the self-dedup case), in
        // which case they share one index block. The cache only allows one
        // live guard per block, so `dup_guard` must be acquired first and
        // is then the *only* view of that shared index block: a collapse
        // rewrites `dup_guard` in place, and a later outer iteration must
        // see that rewrite rather than a value snapshotted before it
        // happened, or the tie-break in the doc comment below does not
        // hold (a stale `s_i` would re-collapse a slot the first winner
        // already claimed).
        let self_dedup = src.index_block() == dup.index_block();

        let mut dup_handle = self.cache.get(dup.index_block().as_index());
        let mut dup_guard = dup_handle.lock().read().map_err(|(_, e)| e)?;

        // Snapshot src's block list up front when it is a distinct index
        // block; the self-dedup case instead reads `s_i` live from
        // `dup_guard` each iteration, below.
        let src_blocks = if self_dedup {
            None
        } else {
            let mut src_handle = self.cache.get(src.index_block().as_index());
            let src_guard = src_handle.lock().read().map_err(|(_, e)| e)?;
            Some(
                (0..src_data_blocks)
                    .map(|i| src_guard.data::<IndexBlock>().get(i))
                    .collect::<Vec<Option<BlockNo>>>(),
            )
        };

        let mut count = 0i32;
        let mut dirty = false;

        let outcome: Result<(), Error<Device::Error>> = 'pair: {
            for i in 0..src_data_blocks {
                let s_i = match &src_blocks {
                    Some(blocks) => blocks[i],
                    None => dup_guard.data::<IndexBlock>().get(i),
                };
                let Some(s_i) = s_i else { continue };

                let len = if i == last_logical {
                    usize::try_from(src.size() % BLOCK_SIZE as u64).unwrap_or(BLOCK_SIZE)
                } else {
                    BLOCK_SIZE
                };

                let mut s_bytes = [0u8; BLOCK_SIZE];
                {
                    let mut h = self.cache.get(s_i.as_index());
                    match h.lock().read() {
                        Ok(g) => s_bytes.copy_from_slice(g.bytes()),
                        Err((_, e)) => break 'pair Err(e.into()),
                    }
                }

                for j in 0..dup_data_blocks {
                    let Some(d_j) = dup_guard.data::<IndexBlock>().get(j) else {
                        continue;
                    };
                    if s_i == d_j {
                        continue;
                    }

                    let mut d_bytes = [0u8; BLOCK_SIZE];
                    {
                        let mut h = self.cache.get(d_j.as_index());
                        match h.lock().read() {
                            Ok(g) => d_bytes.copy_from_slice(g.bytes()),
                            Err((_, e)) => break 'pair Err(e.into()),
                        }
                    }

                    if s_bytes[..len] != d_bytes[..len] {
                        continue;
                    }

                    if let Err(e) = self.unlink_block(d_j) {
                        break 'pair Err(e);
                    }
                    dup_guard.data_mut::<IndexBlock>().set(j, Some(s_i));
                    if let Err(e) = self.link_block(s_i) {
                        break 'pair Err(e);
                    }
                    count += 1;
                    dirty = true;
                }
            }
            Ok(())
        };

        if dirty {
            dup_guard.write_back();
        }
        outcome.map(|()| count)
    }

    /// Runs the offline dedup pass: for each candidate in `duplicated`,
    /// tries to collapse its blocks against `sources` (falling back to a
    /// second pass against `duplicated` itself if the first finds
    /// nothing), then clears the dedup-candidate block.
    ///
    /// `iget` resolves a candidate inode number to an [`Inode`]; a `None`
    /// return (not found, or the host declines to load it) is logged and
    /// skipped, since dedup is best-effort and never fatal to the mount.
    pub fn deduplicate<I, F>(&self, mut iget: F) -> Result<i32, Error<Device::Error>>
    where
        I: Inode,
        F: FnMut(InodeNo) -> Option<I>,
    {
        let (sources, duplicated) = {
            let mut handle = self.cache.get(self.super_block.dup_block().as_index());
            let guard = handle.lock().read().map_err(|(_, e)| e)?;
            let block = guard.data::<DedupCandidateBlock>();
            let sources: Vec<InodeNo> = block.entries(CandidateList::Sources).collect();
            let duplicated: Vec<InodeNo> = block.entries(CandidateList::Duplicated).collect();
            (sources, duplicated)
        };

        let mut total = 0i32;
        for d_ino in duplicated.iter().copied() {
            let Some(dup) = iget(d_ino) else {
                log::warn!("deduplicate: candidate inode {d_ino} unavailable, skipping");
                continue;
            };
            let threshold = i32::try_from(dup.block_count().saturating_sub(1)).unwrap_or(i32::MAX);
            let mut found = 0i32;

            for &s_ino in &sources {
                if s_ino == d_ino {
                    continue;
                }
                let Some(src) = iget(s_ino) else { continue };
                match self.dedup_file(&src, &dup) {
                    Ok(n) => found += n,
                    Err(e) => log::warn!("dedup_file({s_ino}, {d_ino}) failed: {e}"),
                }
                if found >= threshold {
                    break;
                }
            }

            if found == 0 {
                for &s_ino in &duplicated {
                    if s_ino == d_ino {
                        continue;
                    }
                    let Some(src) = iget(s_ino) else { continue };
                    match self.dedup_file(&src, &dup) {
                        Ok(n) => found += n,
                        Err(e) => log::warn!("dedup_file({s_ino}, {d_ino}) failed: {e}"),
                    }
                    if found >= threshold {
                        break;
                    }
                }
            }

            total += found;
        }

        self.clear_dup_block()?;
        Ok(total)
    }
}
