//! Reentrant, usage-counted mutual exclusion.
//!
//! A [`ReentrantLock`] lets the thread that already holds it acquire it again
//! without blocking. Every acquisition bumps a usage counter; the lock is only
//! handed to another thread once the holder has released it as many times as
//! it acquired it.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use thiserror::Error;
use tracing::error;

/// Lock discipline violations.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LockError {
    /// Release requested while nobody holds the lock.
    #[error("release of a lock that is not held")]
    NotHeld,
    /// Release requested by a thread other than the holder.
    #[error("release from a thread that does not hold the lock")]
    NotHolder,
    /// Raw release would leave a live guard without the lock behind it.
    #[error("raw release while guards are still alive")]
    GuardsOutstanding,
}

#[derive(Debug, Default)]
struct Ownership {
    holder: Option<ThreadId>,
    usage_count: usize,
    // Acquisitions owned by live guards; always <= usage_count.
    guards: usize,
}

/// Mutual exclusion primitive the holding thread may re-acquire.
///
/// Guards only hand out shared references because one thread may hold
/// several guards at once; wrap the protected value in a `RefCell` for
/// mutation.
pub struct ReentrantLock<T: ?Sized = ()> {
    // Short-lived guard over holder/usage_count; never held while blocking.
    ownership: Mutex<Ownership>,
    released: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through a `ReentrantGuard`, which exists only
// on the thread recorded as holder and is `!Send`. All guards of one holder
// live on that single thread, so `T` never needs to be `Sync`.
unsafe impl<T: ?Sized + Send> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    /// Wrap `data` in an unlocked lock.
    pub fn new(data: T) -> Self {
        Self {
            ownership: Mutex::new(Ownership::default()),
            released: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the lock and return the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for ReentrantLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> ReentrantLock<T> {
    /// Acquire the lock and return an RAII guard that releases it on drop.
    pub fn lock(&self) -> ReentrantGuard<'_, T> {
        let mut ownership = self.claim();
        ownership.guards += 1;
        drop(ownership);
        ReentrantGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire without producing a guard; pair with [`ReentrantLock::release`].
    ///
    /// Returns immediately when the calling thread already holds the lock.
    pub fn acquire(&self) {
        drop(self.claim());
    }

    fn claim(&self) -> MutexGuard<'_, Ownership> {
        let me = thread::current().id();
        let mut ownership = self.ownership();

        if ownership.holder == Some(me) {
            ownership.usage_count += 1;
            return ownership;
        }

        while ownership.holder.is_some() {
            ownership = self
                .released
                .wait(ownership)
                .unwrap_or_else(PoisonError::into_inner);
        }

        debug_assert_eq!(ownership.usage_count, 0);
        ownership.holder = Some(me);
        ownership.usage_count = 1;
        ownership
    }

    /// Acquire only if that does not require waiting for another thread.
    pub fn try_acquire(&self) -> bool {
        let me = thread::current().id();
        let mut ownership = self.ownership();

        match ownership.holder {
            Some(holder) if holder == me => {
                ownership.usage_count += 1;
                true
            }
            Some(_) => false,
            None => {
                ownership.holder = Some(me);
                ownership.usage_count = 1;
                true
            }
        }
    }

    /// Drop one usage taken by [`ReentrantLock::acquire`]; the last release
    /// hands the lock to waiting threads.
    ///
    /// Usages owned by live guards cannot be released this way.
    ///
    /// # Panics
    ///
    /// In debug builds, releasing a lock the calling thread does not hold, or
    /// releasing a usage that belongs to a live guard, panics. Release builds
    /// leave the state untouched and return the error.
    pub fn release(&self) -> Result<(), LockError> {
        self.give_back(false)
    }

    fn give_back(&self, from_guard: bool) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut ownership = self.ownership();

        let verdict = match ownership.holder {
            None => Err(LockError::NotHeld),
            Some(holder) if holder != me => Err(LockError::NotHolder),
            Some(_) if !from_guard && ownership.usage_count <= ownership.guards => {
                Err(LockError::GuardsOutstanding)
            }
            Some(_) => Ok(()),
        };

        if let Err(err) = verdict {
            drop(ownership);
            error!(%err, "reentrant lock misuse");
            if cfg!(debug_assertions) {
                panic!("reentrant lock misuse: {err}");
            }
            return Err(err);
        }

        if from_guard {
            ownership.guards -= 1;
        }
        ownership.usage_count -= 1;
        if ownership.usage_count == 0 {
            ownership.holder = None;
            drop(ownership);
            self.released.notify_one();
        }

        Ok(())
    }

    /// Number of outstanding acquisitions by the current holder.
    pub fn usage_count(&self) -> usize {
        self.ownership().usage_count
    }

    /// Whether any thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.usage_count() > 0
    }

    /// Whether the calling thread is the holder.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.ownership().holder == Some(thread::current().id())
    }

    fn ownership(&self) -> MutexGuard<'_, Ownership> {
        self.ownership.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: ?Sized> fmt::Debug for ReentrantLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ownership = self.ownership();
        f.debug_struct("ReentrantLock")
            .field("holder", &ownership.holder)
            .field("usage_count", &ownership.usage_count)
            .field("guards", &ownership.guards)
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`ReentrantLock::lock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReentrantGuard<'a, T: ?Sized> {
    lock: &'a ReentrantLock<T>,
    // Release is keyed on the acquiring thread.
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized> Deref for ReentrantGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard exists only on the holding thread (see `Sync` impl).
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for ReentrantGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.lock.give_back(true);
    }
}
