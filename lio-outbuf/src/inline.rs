//! Detection of completions that run inside their own issuing call.
//!
//! A transport may resolve a write before `write()` returns, on the calling
//! thread. The producer that issued it is still on the stack and learns the
//! outcome from `flush`'s return value, so the writable notification must not
//! fire as well.
//!
//! An [`IssueMarker`] is created per issue chain and shared by the initial
//! write and all of its continuations. While an [`InlineGuard`] is alive the
//! marker records the issuing thread; a completion is inline when it runs on
//! that thread while the guard is alive. Completions on other threads, or
//! after the issuing call returned, are not.

use std::{
  sync::Arc,
  thread::{self, ThreadId},
};

use crate::sync::Mutex;

#[derive(Clone, Default)]
pub struct IssueMarker {
  issuing: Arc<Mutex<Option<ThreadId>>>,
}

impl IssueMarker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Marks the current thread as issuing until the guard is dropped.
  pub fn enter(&self) -> InlineGuard<'_> {
    *self.issuing.lock() = Some(thread::current().id());
    InlineGuard { marker: self }
  }

  pub fn is_inline(&self) -> bool {
    *self.issuing.lock() == Some(thread::current().id())
  }
}

pub struct InlineGuard<'a> {
  marker: &'a IssueMarker,
}

impl Drop for InlineGuard<'_> {
  fn drop(&mut self) {
    *self.marker.issuing.lock() = None;
  }
}
