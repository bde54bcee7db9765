//! Error types for the block-sharing subsystem.

/// Failure modes the core reports to its caller.
///
/// `E` is the underlying block device's error type (see
/// [`block_io::BlockDevice::Error`]); it is threaded through rather than
/// boxed so a caller on a `no_std` target never has to allocate to inspect
/// one.
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    /// A block read or write failed.
    #[error("block i/o error")]
    Io(#[source] E),
    /// COW needed a fresh block but the allocator returned none.
    #[error("no free block available")]
    NoSpace,
    /// On-disk metadata violates an invariant (refcount underflow, or a
    /// block number outside the data range). The operation is skipped
    /// rather than the mount aborted; see the corrupt-handling policy.
    #[error("corrupt metadata: {0}")]
    Corrupt(&'static str),
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Io(e)
    }
}

pub type Result<T, E> = core::result::Result<T, Error<E>>;
