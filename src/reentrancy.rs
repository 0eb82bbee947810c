//! Debug-only reentrancy guard for a shared lock.
//!
//! Detects a thread trying to take a lock it already holds, which with a
//! plain mutex would deadlock silently. In debug builds the tracker records
//! the holding thread and the nested attempt panics with a clear message.
//! In release builds it compiles down to the bare mutex guard.

use core::ops::{Deref, DerefMut};
use parking_lot::{Mutex, MutexGuard};
#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-lock holder tracker. Pair it with the `Mutex` it protects and always
/// lock through [`DebugReentrancy::lock`].
#[derive(Debug)]
pub struct DebugReentrancy {
    #[cfg(debug_assertions)]
    holder: AtomicUsize,
}

// Address of a thread-local is unique among live threads and never zero.
#[cfg(debug_assertions)]
fn thread_token() -> usize {
    thread_local! {
        static TOKEN: u8 = const { 0 };
    }
    TOKEN.with(|t| t as *const u8 as usize)
}

impl DebugReentrancy {
    pub const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            holder: AtomicUsize::new(0),
        }
    }

    /// Lock `mutex`, panicking in debug builds if this thread already holds it.
    #[inline]
    pub fn lock<'a, T>(&'a self, mutex: &'a Mutex<T>) -> Locked<'a, T> {
        #[cfg(debug_assertions)]
        {
            let me = thread_token();
            // Only this thread ever stores its own token, so a relaxed load
            // cannot observe it unless this thread is the holder.
            assert!(
                self.holder.load(Ordering::Relaxed) != me,
                "reentrancy detected: lock re-entered by the thread holding it"
            );
            let guard = mutex.lock();
            self.holder.store(me, Ordering::Relaxed);
            Locked { owner: self, guard }
        }

        #[cfg(not(debug_assertions))]
        {
            Locked {
                guard: mutex.lock(),
                _owner: core::marker::PhantomData,
            }
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `DebugReentrancy::lock`. Clears the holder mark
/// before the mutex itself is released.
pub struct Locked<'a, T> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    #[cfg(not(debug_assertions))]
    _owner: core::marker::PhantomData<&'a DebugReentrancy>,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for Locked<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for Locked<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for Locked<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.owner.holder.store(0, Ordering::Relaxed);
    }
}
