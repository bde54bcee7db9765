//! A simple mutex API.
#![cfg_attr(not(feature = "std"), no_std)]

use core::ops::DerefMut;

/// A mutex.
pub trait Mutex {
    /// The type of the data that the mutex protects.
    type Data;

    /// The type of the guard that the `lock` method returns.
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a new mutex.
    fn new(data: Self::Data) -> Self;

    /// Locks the mutex.
    fn lock(&self) -> Self::Guard<'_>;
}

#[cfg(feature = "std")]
mod std_impl {
    use super::Mutex;

    /// A [`Mutex`] backed by [`std::sync::Mutex`].
    ///
    /// Poison is ignored (the guarded data is recovered as-is) rather than
    /// propagated, matching how the rest of this API has no notion of
    /// poisoning.
    pub struct StdMutex<T>(std::sync::Mutex<T>);

    pub struct StdMutexGuard<'a, T>(std::sync::MutexGuard<'a, T>);

    impl<T> Mutex for StdMutex<T> {
        type Data = T;
        type Guard<'a>
            = StdMutexGuard<'a, T>
        where
            Self: 'a;

        fn new(data: T) -> Self {
            Self(std::sync::Mutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            StdMutexGuard(self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
        }
    }

    impl<T> std::ops::Deref for StdMutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.0
        }
    }

    impl<T> std::ops::DerefMut for StdMutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            &mut self.0
        }
    }
}

#[cfg(feature = "std")]
pub use std_impl::{StdMutex, StdMutexGuard};
