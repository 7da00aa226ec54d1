//! [`Transport`] over any [`io::Write`], completing every write synchronously
//! on the calling thread.
//!
//! Useful for in-memory sinks and for blocking sockets where an extra thread
//! buys nothing. Every completion is inline, so a connection driven by it only
//! ever learns about finished writes through `flush`'s return value.

use std::{io, time::Duration};

use super::{Callback, Transport};
use crate::buf::{self, WriteBuf};
use crate::sync::Mutex;

pub struct InlineTransport<W> {
  writer: Mutex<W>,
}

impl<W> InlineTransport<W>
where
  W: io::Write + Send + 'static,
{
  pub fn new(writer: W) -> Self {
    Self { writer: Mutex::new(writer) }
  }

  /// Runs `f` with exclusive access to the writer.
  pub fn with_writer<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
    f(&mut self.writer.lock())
  }

  pub fn into_inner(self) -> W {
    self.writer.into_inner()
  }

  fn write_bufs(&self, bufs: &[WriteBuf]) -> io::Result<i64> {
    let slices = buf::io_slices(bufs);
    if slices.is_empty() {
      return Ok(0);
    }

    let mut writer = self.writer.lock();
    loop {
      match writer.write_vectored(&slices) {
        // A writer that accepts nothing is closed.
        Ok(0) => return Ok(-1),
        Ok(n) => return Ok(n as i64),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => return Err(err),
      }
    }
  }
}

impl<W> Transport for InlineTransport<W>
where
  W: io::Write + Send + 'static,
{
  fn write(&self, buf: WriteBuf, _timeout: Duration, done: Callback<WriteBuf>) {
    let res = self.write_bufs(std::slice::from_ref(&buf));
    done((res, buf));
  }

  fn write_vectored(
    &self,
    bufs: Vec<WriteBuf>,
    _timeout: Duration,
    done: Callback<Vec<WriteBuf>>,
  ) {
    let res = self.write_bufs(&bufs);
    done((res, bufs));
  }
}
