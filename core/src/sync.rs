//! Synchronization primitives to hand values between watcher threads and their consumers.
//!
//! ## Dispatch contexts
//! Threads that deliver notifications (e.g. the process watcher thread) are the only
//! mechanism able to fulfill some cells. Such a thread is marked with
//! [`DispatchContext::enter`], and a blocking [`BlockingCell::get`] on it panics
//! instead of deadlocking. Use [`BlockingCell::try_get`] there.

use std::cell::Cell;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

thread_local! {
    static DISPATCHING: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as a dispatch context while alive.
pub struct DispatchContext {
    _private: (),
}

impl DispatchContext {
    /// Marks the current thread; the mark is removed when the guard drops.
    pub fn enter() -> Self {
        DISPATCHING.with(|depth| depth.set(depth.get() + 1));

        Self { _private: () }
    }

    /// Whether the current thread is a dispatch context.
    pub fn is_active() -> bool {
        DISPATCHING.with(|depth| depth.get() > 0)
    }
}

impl Drop for DispatchContext {
    fn drop(&mut self) {
        DISPATCHING.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Values are only replaced as a whole, so a poisoned lock still holds a valid value.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A cell holding at most one value, whose reads block until it is written.
pub struct BlockingCell<T> {
    value: Mutex<Option<T>>,
    fulfilled: Condvar,
}

impl<T> Default for BlockingCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingCell<T> {
    /// Creates an empty cell.
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            fulfilled: Condvar::new(),
        }
    }

    /// Creates a cell that is already fulfilled.
    pub fn with_value(value: T) -> Self {
        Self {
            value: Mutex::new(Some(value)),
            fulfilled: Condvar::new(),
        }
    }

    /// Stores the value and releases every blocked reader.
    /// Later calls overwrite the value, the cell never becomes empty again.
    pub fn set(&self, value: T) {
        *lock(&self.value) = Some(value);
        self.fulfilled.notify_all();
    }

    /// Non-blocking check whether a value has been written.
    pub fn is_fulfilled(&self) -> bool {
        lock(&self.value).is_some()
    }
}

impl<T: Clone> BlockingCell<T> {
    /// Blocks until a value has been written, then returns it.
    ///
    /// # Panics
    /// When called on a [`DispatchContext`] while the cell is still empty.
    pub fn get(&self) -> T {
        let mut value = lock(&self.value);
        if value.is_none() && DispatchContext::is_active() {
            panic!("blocking read on a dispatch context would deadlock");
        }

        loop {
            if let Some(value) = value.as_ref() {
                return value.clone();
            }
            value = self
                .fulfilled
                .wait(value)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until a value has been written or the timeout elapsed.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut value = lock(&self.value);

        loop {
            if let Some(value) = value.as_ref() {
                return Some(value.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if remaining.is_zero() || DispatchContext::is_active() {
                return None;
            }
            value = self
                .fulfilled
                .wait_timeout(value, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Returns the value if it has been written, without blocking.
    pub fn try_get(&self) -> Option<T> {
        lock(&self.value).clone()
    }
}

/// A cell always holding a value, mutated through atomic transactions.
pub struct TransactionalCell<T> {
    value: Mutex<T>,
    holder: Mutex<Option<ThreadId>>,
}

impl<T> TransactionalCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            holder: Mutex::new(None),
        }
    }

    /// Runs `f` on the value under mutual exclusion and returns its result.
    /// No other accessor observes the value between the read and write of `f`.
    ///
    /// # Panics
    /// When `f` accesses the same cell again.
    pub fn update<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut value = self.acquire();
        *lock(&self.holder) = Some(thread::current().id());
        let _holder = Holder(&self.holder);

        f(&mut value)
    }

    /// Replaces the value.
    pub fn set(&self, value: T) {
        self.update(|current| *current = value)
    }

    fn acquire(&self) -> MutexGuard<'_, T> {
        if *lock(&self.holder) == Some(thread::current().id()) {
            panic!("recursive access to a TransactionalCell inside its own transaction");
        }

        lock(&self.value)
    }
}

/// Clears the transaction holder, also when the transaction panics.
struct Holder<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for Holder<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

impl<T: Clone> TransactionalCell<T> {
    /// Returns a copy of the current value.
    ///
    /// # Panics
    /// When called from inside a transaction of the same cell.
    pub fn get(&self) -> T {
        self.acquire().clone()
    }
}

impl<T: Default> Default for TransactionalCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
