//! Inode fetch contract.
//!
//! Inode allocation, eviction, and directory-entry handling live in the
//! host filesystem; this crate only needs enough of an inode's shape to
//! walk its index block.

use dedupfs_types::{BlockNo, InodeNo};

/// A loaded inode, as seen by the block-sharing subsystem.
///
/// `iget`/`iput` (acquiring and releasing the handle) are the host's
/// concern; a value of this trait is assumed already resolved and pinned
/// for the duration of the call.
pub trait Inode {
    /// This inode's number.
    fn ino(&self) -> InodeNo;

    /// Block number of this inode's index block.
    fn index_block(&self) -> BlockNo;

    /// File size in bytes.
    fn size(&self) -> u64;

    /// Total block count charged to this inode, *including* the index
    /// block itself (so the last usable data-block slot is
    /// `block_count() - 2`, matching the on-disk convention that reserves
    /// one trailing, unused index-block slot).
    fn block_count(&self) -> u32;
}
