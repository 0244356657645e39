//! Named reentrant locks guarding the state shared between the network
//! reactor and the simulation thread.

use crate::lock::{LockError, ReentrantGuard, ReentrantLock};
use std::cell::RefCell;
use std::fmt;
use tracing::warn;

/// Resources protected by a [`LockFacility`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// The simulated world.
    World,
    /// The account store.
    Accounts,
}

impl Resource {
    /// Every protected resource.
    pub const ALL: [Resource; 2] = [Resource::World, Resource::Accounts];
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::World => f.write_str("world"),
            Resource::Accounts => f.write_str("accounts"),
        }
    }
}

/// Guard over one resource of the facility. Borrow the `RefCell` to read or
/// mutate the resource.
pub type FacilityGuard<'a, T> = ReentrantGuard<'a, RefCell<T>>;

/// Owns the world `W` and the account store `A`, each behind its own
/// reentrant lock.
///
/// Share it between threads with an `Arc`. A thread may lock the same
/// resource again while holding it, e.g. a message handler that locks the
/// world and then calls a helper that locks it too.
pub struct LockFacility<W, A> {
    world: ReentrantLock<RefCell<W>>,
    accounts: ReentrantLock<RefCell<A>>,
}

impl<W, A> LockFacility<W, A> {
    /// Put `world` and `accounts` under lock.
    pub fn new(world: W, accounts: A) -> Self {
        Self {
            world: ReentrantLock::new(RefCell::new(world)),
            accounts: ReentrantLock::new(RefCell::new(accounts)),
        }
    }

    /// Lock the world for the lifetime of the guard.
    pub fn world(&self) -> FacilityGuard<'_, W> {
        self.world.lock()
    }

    /// Lock the account store for the lifetime of the guard.
    pub fn accounts(&self) -> FacilityGuard<'_, A> {
        self.accounts.lock()
    }

    /// Lock (`true`) or unlock (`false`) a resource without a guard.
    ///
    /// Every `lock(resource, true)` must be matched by a
    /// `lock(resource, false)` on the same thread. Unlocking cannot release a
    /// usage held by a live [`FacilityGuard`]; that is
    /// [`LockError::GuardsOutstanding`].
    pub fn lock(&self, resource: Resource, do_lock: bool) -> Result<(), LockError> {
        match (resource, do_lock) {
            (Resource::World, true) => {
                self.world.acquire();
                Ok(())
            }
            (Resource::Accounts, true) => {
                self.accounts.acquire();
                Ok(())
            }
            (Resource::World, false) => self.world.release(),
            (Resource::Accounts, false) => self.accounts.release(),
        }
    }

    /// Whether any thread currently holds `resource`.
    pub fn is_locked(&self, resource: Resource) -> bool {
        self.usage_count(resource) > 0
    }

    /// Outstanding acquisitions of `resource` by its holder.
    pub fn usage_count(&self, resource: Resource) -> usize {
        match resource {
            Resource::World => self.world.usage_count(),
            Resource::Accounts => self.accounts.usage_count(),
        }
    }

    /// Whether the calling thread holds `resource`.
    pub fn is_held_by_current_thread(&self, resource: Resource) -> bool {
        match resource {
            Resource::World => self.world.is_held_by_current_thread(),
            Resource::Accounts => self.accounts.is_held_by_current_thread(),
        }
    }
}

impl<W: Default, A: Default> Default for LockFacility<W, A> {
    fn default() -> Self {
        Self::new(W::default(), A::default())
    }
}

impl<W, A> Drop for LockFacility<W, A> {
    fn drop(&mut self) {
        for resource in Resource::ALL {
            if self.is_locked(resource) {
                warn!(%resource, "lock facility dropped while resource still locked");
            }
        }
    }
}

impl<W, A> fmt::Debug for LockFacility<W, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFacility")
            .field("world", &self.world)
            .field("accounts", &self.accounts)
            .finish()
    }
}
