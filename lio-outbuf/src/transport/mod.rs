//! The completion-based write primitive an [`OutputBuffer`](crate::OutputBuffer)
//! drives.
//!
//! A transport takes buffers by value, starts a write, and later hands the
//! buffers back through a callback together with the outcome, the same shape
//! as lio's `when_done(|(result, buf)| ...)`. The callback may run on any
//! thread, including inline on the caller's thread before `write` returns.
//!
//! # Result convention
//!
//! - `Ok(n)` with `n >= 0`: `n` bytes were written from the front of the
//!   buffers. The transport does **not** advance the buffers itself; the
//!   buffer layer does that with the reported count.
//! - `Ok(n)` with `n < 0`: the peer closed the connection mid-write.
//! - `Err(e)`: any other failure. `ErrorKind::TimedOut` means the deadline
//!   passed.
//!
//! Every callback must be invoked at most once. Dropping it without calling
//! it is allowed (for example on shutdown) and releases the write permit.

use std::{sync::Arc, time::Duration};

use crate::buf::{BufResult, WriteBuf};

#[cfg(unix)]
pub mod fd;
pub mod inline;

/// Completion of a write: the outcome plus the buffers that were passed in.
pub type Callback<B> = Box<dyn FnOnce(BufResult<i64, B>) + Send>;

pub trait Transport: Send + Sync + 'static {
  /// Writes from a single buffer.
  fn write(&self, buf: WriteBuf, timeout: Duration, done: Callback<WriteBuf>);

  /// Gathering write: the buffers are written in order as one operation.
  fn write_vectored(
    &self,
    bufs: Vec<WriteBuf>,
    timeout: Duration,
    done: Callback<Vec<WriteBuf>>,
  );

  /// Whether the transport itself still holds bytes it has not written.
  fn has_pending(&self) -> bool {
    false
  }
}

impl<T> Transport for Arc<T>
where
  T: Transport,
{
  fn write(&self, buf: WriteBuf, timeout: Duration, done: Callback<WriteBuf>) {
    (**self).write(buf, timeout, done)
  }

  fn write_vectored(
    &self,
    bufs: Vec<WriteBuf>,
    timeout: Duration,
    done: Callback<Vec<WriteBuf>>,
  ) {
    (**self).write_vectored(bufs, timeout, done)
  }

  fn has_pending(&self) -> bool {
    (**self).has_pending()
  }
}
