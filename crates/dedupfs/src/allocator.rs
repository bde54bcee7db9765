//! Free-block allocator contract.
//!
//! Allocation and freeing of block numbers themselves (the free-block
//! bitmap) is out of scope for this crate; it is provided by the host
//! filesystem. What the core *does* own is the bookkeeping that must stay
//! paired with every allocator call: the Block-Info Store refcount, and the
//! `nr_free_blocks` counter's share/unshare adjustment (see
//! [`crate::block_info`]).

use dedupfs_types::BlockNo;

/// The free-block bitmap, as seen by the block-sharing subsystem.
///
/// Implementations neither read nor write the Block-Info Store: the caller
/// is responsible for calling [`link_block`](crate::block_info::link_block)
/// after `alloc_block` and for the implicit free inside
/// [`unlink_block`](crate::block_info::unlink_block).
pub trait Allocator {
    /// Returns a fresh block number, or `None` if the device is full.
    fn alloc_block(&self) -> Option<BlockNo>;

    /// Returns `bno` to the free-block bitmap.
    fn free_block(&self, bno: BlockNo);

    /// Adjusts the "reported free blocks" counter by `delta`.
    ///
    /// Called by [`link_block`](crate::block_info::link_block) and
    /// [`unlink_block`](crate::block_info::unlink_block) to account for
    /// share/unshare events that neither allocate nor free a block number
    /// (see the free-block accounting asymmetry in the design notes).
    fn adjust_free_count(&self, delta: i32);
}
