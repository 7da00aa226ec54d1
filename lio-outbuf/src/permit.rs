//! The write permit: a single-slot token meaning "no asynchronous write is in
//! flight".
//!
//! Holding a [`PermitGuard`] is the only way to issue an asynchronous write.
//! The guard releases the permit when dropped, so it travels inside the
//! completion callback of the in-flight write and is released exactly once,
//! whichever way that write ends (success, failure, or the callback being
//! dropped by a transport that shuts down).
//!
//! [`WritePermit::reset`] forces the permit free for connection teardown. A
//! generation counter makes guards issued before the reset inert, so a late
//! completion cannot release a permit that somebody else holds by then.

use std::{
  fmt,
  sync::Arc,
  time::{Duration, Instant},
};

use crate::sync::{Condvar, Mutex};

#[derive(Default)]
struct PermitState {
  held: bool,
  generation: u64,
}

#[derive(Default)]
pub struct WritePermit {
  state: Mutex<PermitState>,
  freed: Condvar,
}

impl WritePermit {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Takes the permit if it is free. Never blocks.
  pub fn try_acquire(self: &Arc<Self>) -> Option<PermitGuard> {
    let mut state = self.state.lock();
    self.grant(&mut state)
  }

  /// Takes the permit, waiting up to `timeout` for the current holder to
  /// release it.
  pub fn acquire_timeout(
    self: &Arc<Self>,
    timeout: Duration,
  ) -> Option<PermitGuard> {
    let deadline = Instant::now() + timeout;
    let mut state = self.state.lock();

    loop {
      if let Some(guard) = self.grant(&mut state) {
        return Some(guard);
      }

      let now = Instant::now();
      if now >= deadline {
        return None;
      }

      let (next, _timed_out) = self.freed.wait_timeout(state, deadline - now);
      state = next;
    }
  }

  pub fn is_held(&self) -> bool {
    self.state.lock().held
  }

  /// Forces the permit free regardless of who holds it.
  pub fn reset(&self) {
    let mut state = self.state.lock();
    state.generation = state.generation.wrapping_add(1);
    state.held = false;
    self.freed.notify_all();
  }

  fn grant(self: &Arc<Self>, state: &mut PermitState) -> Option<PermitGuard> {
    if state.held {
      return None;
    }
    state.generation = state.generation.wrapping_add(1);
    state.held = true;

    Some(PermitGuard { permit: Arc::clone(self), generation: state.generation })
  }

  fn release(&self, generation: u64) {
    let mut state = self.state.lock();
    if state.held && state.generation == generation {
      state.held = false;
      self.freed.notify_all();
    }
  }
}

impl fmt::Debug for WritePermit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WritePermit").field("held", &self.is_held()).finish()
  }
}

/// Proof of holding the write permit. Releases it on drop.
#[must_use = "dropping the guard releases the write permit"]
pub struct PermitGuard {
  permit: Arc<WritePermit>,
  generation: u64,
}

impl PermitGuard {
  /// False once the permit was [reset](WritePermit::reset) after this guard
  /// was granted.
  pub fn is_current(&self) -> bool {
    let state = self.permit.state.lock();
    state.held && state.generation == self.generation
  }
}

impl Drop for PermitGuard {
  fn drop(&mut self) {
    self.permit.release(self.generation);
  }
}

impl fmt::Debug for PermitGuard {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PermitGuard").field("generation", &self.generation).finish()
  }
}
