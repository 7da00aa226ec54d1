//! Synchronization primitives wrapping `std::sync` without poisoning.
//!
//! Completion callbacks run on transport threads. A panic inside one of them
//! must not turn every later `lock()` on the connection into a panic too, so
//! poisoned locks are unwrapped and used as-is.

use std::sync as std_sync;
use std::time::Duration;

/// A mutual exclusion primitive that wraps `std::sync::Mutex`.
///
/// Unlike `std::sync::Mutex`, this does not support poisoning.
pub struct Mutex<T: ?Sized> {
  inner: std_sync::Mutex<T>,
}

impl<T> Mutex<T> {
  /// Creates a new mutex in an unlocked state ready for use.
  #[inline]
  pub const fn new(value: T) -> Self {
    Self { inner: std_sync::Mutex::new(value) }
  }

  /// Consumes this mutex, returning the underlying data.
  #[inline]
  pub fn into_inner(self) -> T {
    self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
  }
}

impl<T: ?Sized> Mutex<T> {
  /// Acquires a mutex, blocking the current thread until it is able to do so.
  ///
  /// This function does not propagate poisoning, so it will always succeed.
  #[inline]
  pub fn lock(&self) -> MutexGuard<'_, T> {
    MutexGuard { inner: self.inner.lock().unwrap_or_else(|e| e.into_inner()) }
  }
}

impl<T: Default> Default for Mutex<T> {
  fn default() -> Self {
    Self::new(T::default())
  }
}

/// An RAII implementation of a "scoped lock" of a mutex.
///
/// When this structure is dropped (falls out of scope), the lock will be unlocked.
pub struct MutexGuard<'a, T: ?Sized> {
  inner: std_sync::MutexGuard<'a, T>,
}

impl<T: ?Sized> std::ops::Deref for MutexGuard<'_, T> {
  type Target = T;

  #[inline]
  fn deref(&self) -> &T {
    &self.inner
  }
}

impl<T: ?Sized> std::ops::DerefMut for MutexGuard<'_, T> {
  #[inline]
  fn deref_mut(&mut self) -> &mut T {
    &mut self.inner
  }
}

/// A condition variable paired with [`Mutex`].
#[derive(Default)]
pub struct Condvar {
  inner: std_sync::Condvar,
}

impl Condvar {
  /// Blocks until notified or until `timeout` elapses.
  ///
  /// Returns the re-acquired guard and `true` if the wait timed out. Spurious
  /// wakeups are possible, callers loop on their own predicate.
  pub fn wait_timeout<'a, T>(
    &self,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
  ) -> (MutexGuard<'a, T>, bool) {
    let (inner, res) = self
      .inner
      .wait_timeout(guard.inner, timeout)
      .unwrap_or_else(|e| e.into_inner());
    (MutexGuard { inner }, res.timed_out())
  }

  #[inline]
  pub fn notify_all(&self) {
    self.inner.notify_all();
  }
}
