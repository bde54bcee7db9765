//! A growable bitset over inode numbers.
//!
//! Backs [`crate::dedup_registry`]'s `isrc_bitmap`/`idup_bitmap`: volatile,
//! in-memory only, rebuilt empty at mount. Not persisted, so there is no
//! on-disk layout to match and a plain word array is enough.

extern crate alloc;

use alloc::vec::Vec;

use dedupfs_types::InodeNo;
use mutex_api::Mutex;

/// A set of inode numbers, implemented as a bit-per-inode word array that
/// grows to fit the highest inode number seen.
pub struct InodeBitset<M> {
    words: M,
}

impl<M> InodeBitset<M>
where
    M: Mutex<Data = Vec<u64>>,
{
    #[must_use]
    pub fn new() -> Self {
        Self { words: M::new(Vec::new()) }
    }

    /// Sets the bit for `ino` and returns its previous value.
    ///
    /// This is the test-and-set the registry needs: a caller only wants to
    /// append to the on-disk list the first time an inode is seen.
    pub fn test_and_set(&self, ino: InodeNo) -> bool {
        let idx = ino.as_index();
        let word = idx / 64;
        let bit = 1u64 << (idx % 64);

        let mut words = self.words.lock();
        if word >= words.len() {
            words.resize(word + 1, 0);
        }
        let was_set = words[word] & bit != 0;
        words[word] |= bit;
        was_set
    }

    /// Clears every bit, as happens when the dedup-candidate block is
    /// zeroed after a pass.
    pub fn clear(&self) {
        let mut words = self.words.lock();
        words.fill(0);
    }
}

impl<M> Default for InodeBitset<M>
where
    M: Mutex<Data = Vec<u64>>,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type StdBitset = InodeBitset<mutex_api::StdMutex<Vec<u64>>>;

    #[test]
    fn test_and_set_reports_previous_value() {
        let set = StdBitset::new();
        assert!(!set.test_and_set(InodeNo::new(5)));
        assert!(set.test_and_set(InodeNo::new(5)));
        assert!(!set.test_and_set(InodeNo::new(64)));
    }

    #[test]
    fn clear_resets_all_bits() {
        let set = StdBitset::new();
        set.test_and_set(InodeNo::new(130));
        set.clear();
        assert!(!set.test_and_set(InodeNo::new(130)));
    }
}
