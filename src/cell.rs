//! # Reader/writer-guarded mutable slot.
//!
//! [`Protected`] is the basis for all shared mutable state in the runtime:
//! operation error lists, observer registries, group ledgers, retry counters.
//! Access is closure-scoped so a guard can never escape the call site and is
//! therefore never held across an `await` or a user callback.

use parking_lot::RwLock;

/// A mutable slot guarded by a reader/writer lock.
///
/// Readers run concurrently; writers take the lock exclusively. Callers that
/// need to invoke user code with the contents must clone them out first.
pub struct Protected<T> {
    slot: RwLock<T>,
}

impl<T> Protected<T> {
    /// Wraps a value in a new protected slot.
    pub fn new(value: T) -> Self {
        Self {
            slot: RwLock::new(value),
        }
    }

    /// Runs `f` with shared access to the contents.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.slot.read())
    }

    /// Runs `f` with exclusive access to the contents.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.slot.write())
    }

    /// Replaces the contents, returning the previous value.
    pub fn replace(&self, value: T) -> T {
        std::mem::replace(&mut *self.slot.write(), value)
    }
}

impl<T: Clone> Protected<T> {
    /// Returns a clone of the contents.
    pub fn get(&self) -> T {
        self.slot.read().clone()
    }
}

impl<T: Default> Default for Protected<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Protected<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Protected").field(&*self.slot.read()).finish()
    }
}
