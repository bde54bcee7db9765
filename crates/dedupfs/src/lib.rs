//! Block-sharing subsystem for a block-addressed on-disk filesystem:
//! copy-on-write data blocks with per-block reference counts, plus offline
//! content deduplication.
//!
//! Four pieces, leaves-first:
//!
//! - [`block_info`] — the Block-Info Store: one refcount per data block.
//! - [`cow`] — the COW write path, built on the BIS.
//! - [`dedup_registry`] — the on-disk/in-memory candidate lists fed by the
//!   read and write paths.
//! - [`dedup`] — the offline pass run at unmount, built on all three.
//!
//! Superblock bootstrap, inode allocation, directory entries, and the
//! surrounding VFS glue are the host filesystem's concern; this crate only
//! needs the [`allocator::Allocator`] and [`inode::Inode`] contracts to
//! reach them.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod allocator;
mod bitset;
pub mod block_info;
pub mod cow;
pub mod dedup;
pub mod dedup_registry;
pub mod error;
mod fs;
pub mod inode;

#[cfg(test)]
mod test_support;

pub use dedupfs_types as types;
pub use error::Error;
pub use fs::FileSystem;
