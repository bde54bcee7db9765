//! On-disk data types for the block-sharing subsystem.
//!
//! The data layout:
//!
//! | region                     | size (blocks)     | content               | type               |
//! |----------------------------|--------------------|-----------------------|--------------------|
//! | `0`                        | 1                  | Super Block           | [`SuperBlock`]     |
//! | `1..1+nr_istore`           | `nr_istore`        | inode table           | (external)         |
//! | ...                        | `nr_ifree`         | free-inode bitmap     | (external)         |
//! | ...                        | `nr_bfree`         | free-block bitmap     | (external)         |
//! | `FIRST_BINFO..FIRST_DATA`  | `nr_bstore`        | Block-Info Store      | [`BisBlock`]       |
//! | `FIRST_DATA..`             | (remainder)        | data blocks           | [`IndexBlock`] and file content |
//!
//! `index_dupblock` names a single block elsewhere in the device (conventionally
//! inside the metadata regions above) holding the [`DedupCandidateBlock`].

#![cfg_attr(not(test), no_std)]

use core::fmt;

use dataview::{Pod, PodMethods as _};

/// Block size in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Number of `u32` entries that fit in one block.
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / size_of::<u32>();

/// Absolute on-device block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct BlockNo(u32);

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BlockNo {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_index(&self) -> usize {
        usize::try_from(self.0).unwrap()
    }

    #[must_use]
    pub fn checked_add(&self, n: u32) -> Option<Self> {
        self.0.checked_add(n).map(Self)
    }

    /// Returns `self - other`, or `None` if `other > self`.
    #[must_use]
    pub fn checked_sub_index(&self, other: Self) -> Option<usize> {
        self.0.checked_sub(other.0).map(|n| n as usize)
    }
}

/// Inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct InodeNo(u32);

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNo {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_index(&self) -> usize {
        usize::try_from(self.0).unwrap()
    }
}

/// The handful of superblock fields the block-sharing subsystem needs to
/// lay out the Block-Info Store and locate the dedup-candidate block.
///
/// Bootstrap, magic-number validation, and the remaining on-disk fields are
/// the concern of the (out of scope) superblock/mkfs layer.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct SuperBlock {
    /// Total number of blocks on the device, used to bounds-check block
    /// numbers read back out of on-disk metadata.
    pub nr_blocks: u32,
    /// Number of inode-table blocks.
    pub nr_istore: u32,
    /// Number of free-inode-bitmap blocks.
    pub nr_ifree: u32,
    /// Number of free-block-bitmap blocks.
    pub nr_bfree: u32,
    /// Number of Block-Info Store blocks.
    pub nr_bstore: u32,
    /// Block number of the dedup-candidate block.
    pub index_dupblock: u32,
}

impl SuperBlock {
    /// First block number of the Block-Info Store.
    #[must_use]
    pub fn first_binfo(&self) -> BlockNo {
        BlockNo::new(self.first_data().value() - 1 - self.nr_bstore)
    }

    /// First data block number.
    ///
    /// `FIRST_DATA = nr_istore + nr_ifree + nr_bfree + nr_bstore + 2`
    /// (the `+2` accounts for the boot block and the super block).
    #[must_use]
    pub fn first_data(&self) -> BlockNo {
        BlockNo::new(self.nr_istore + self.nr_ifree + self.nr_bfree + self.nr_bstore + 2)
    }

    #[must_use]
    pub fn dup_block(&self) -> BlockNo {
        BlockNo::new(self.index_dupblock)
    }

    /// Locates the Block-Info Store record for `bno`: the BIS block that
    /// holds it, and the record's offset within that block.
    ///
    /// Returns `None` if `bno` falls outside `[FIRST_DATA, nr_blocks)`.
    #[must_use]
    pub fn bis_location(&self, bno: BlockNo) -> Option<(BlockNo, usize)> {
        if bno.value() >= self.nr_blocks {
            return None;
        }
        let r = bno.checked_sub_index(self.first_data())?;
        let block = self
            .first_binfo()
            .checked_add(u32::try_from(r / ENTRIES_PER_BLOCK).ok()?)?;
        Some((block, r % ENTRIES_PER_BLOCK))
    }
}

/// A single Block-Info Store record: the reference count of one data block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod)]
#[repr(transparent)]
pub struct BlockInfo {
    pub nlink: u32,
}

/// One Block-Info Store block: a dense array of [`BlockInfo`] records.
#[derive(Pod)]
#[repr(transparent)]
pub struct BisBlock([BlockInfo; ENTRIES_PER_BLOCK]);
const _: () = const { assert!(size_of::<BisBlock>() == BLOCK_SIZE) };

impl BisBlock {
    #[must_use]
    pub fn record(&self, i: usize) -> &BlockInfo {
        &self.0[i]
    }

    pub fn record_mut(&mut self, i: usize) -> &mut BlockInfo {
        &mut self.0[i]
    }
}

/// Length of each parallel array in the [`DedupCandidateBlock`].
pub const DEDUP_LIST_LEN: usize = BLOCK_SIZE / 8;

/// The dedup-candidate block: two parallel cursor-prefixed inode-number lists.
///
/// Slot 0 of each array holds the index of the last written entry, so slots
/// `1..=cursor` are valid inode numbers. The maximum usable cursor value is
/// `DEDUP_LIST_LEN - 1` (slot `DEDUP_LIST_LEN` is never written).
#[derive(Pod)]
#[repr(C)]
pub struct DedupCandidateBlock {
    sources: [u32; DEDUP_LIST_LEN],
    duplicated: [u32; DEDUP_LIST_LEN],
}
const _: () = const { assert!(size_of::<DedupCandidateBlock>() == BLOCK_SIZE) };

/// Which of the two candidate lists an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateList {
    Sources,
    Duplicated,
}

impl DedupCandidateBlock {
    fn array(&self, which: CandidateList) -> &[u32; DEDUP_LIST_LEN] {
        match which {
            CandidateList::Sources => &self.sources,
            CandidateList::Duplicated => &self.duplicated,
        }
    }

    fn array_mut(&mut self, which: CandidateList) -> &mut [u32; DEDUP_LIST_LEN] {
        match which {
            CandidateList::Sources => &mut self.sources,
            CandidateList::Duplicated => &mut self.duplicated,
        }
    }

    #[must_use]
    pub fn cursor(&self, which: CandidateList) -> usize {
        self.array(which)[0] as usize
    }

    #[must_use]
    pub fn entry(&self, which: CandidateList, i: usize) -> InodeNo {
        InodeNo::new(self.array(which)[i])
    }

    /// Returns the valid entries `1..=cursor` for `which`, in list order.
    #[must_use]
    pub fn entries(&self, which: CandidateList) -> impl Iterator<Item = InodeNo> + '_ {
        let cursor = self.cursor(which);
        (1..=cursor).map(move |i| self.entry(which, i))
    }

    /// Appends `ino` to the list if there is room.
    ///
    /// Returns `false` if the list is already at capacity (cursor would need
    /// to reach `DEDUP_LIST_LEN`, i.e. slot `DEDUP_LIST_LEN - 1` is the last
    /// usable one).
    pub fn push(&mut self, which: CandidateList, ino: InodeNo) -> bool {
        let cursor = self.cursor(which);
        let next = cursor + 1;
        if next >= DEDUP_LIST_LEN {
            return false;
        }
        let arr = self.array_mut(which);
        arr[next] = ino.value();
        arr[0] = next as u32;
        true
    }

    /// Zeros both lists and their cursors.
    pub fn clear(&mut self) {
        *self = Self::zeroed();
    }
}

/// An inode's index block: up to [`ENTRIES_PER_BLOCK`] data block numbers,
/// one per logical block of the file.
///
/// A slot value of `0` means "unallocated" (block number `0` is the boot
/// block and is never a valid data block).
#[derive(Pod)]
#[repr(transparent)]
pub struct IndexBlock([u32; ENTRIES_PER_BLOCK]);
const _: () = const { assert!(size_of::<IndexBlock>() == BLOCK_SIZE) };

impl IndexBlock {
    #[must_use]
    pub fn get(&self, k: usize) -> Option<BlockNo> {
        let n = self.0[k];
        (n != 0).then(|| BlockNo::new(n))
    }

    pub fn set(&mut self, k: usize, bno: Option<BlockNo>) {
        self.0[k] = bno.map_or(0, BlockNo::value);
    }
}
