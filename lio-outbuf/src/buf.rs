//! Buffers handed to a [`Transport`](crate::transport::Transport).
//!
//! Every write moves its buffers into the transport by value and gets them
//! back in the completion, so nothing is aliased while the operation is in
//! flight. Two kinds exist:
//!
//! - [`PrimaryBuffer`]: the connection's fixed-capacity write buffer, reused
//!   across writes. Valid data is `pos..len`, `pos` being the write cursor.
//! - Overflow chunks: immutable [`Bytes`] copies of data that arrived while
//!   a write was already in flight.
//!
//! Both are wrapped in [`WriteBuf`], which implements [`bytes::Buf`]. The
//! transport reads [`Buf::chunk`] and reports a byte count; the buffer layer
//! advances the cursors, the same way lio calls `deinit(bytes)` on a buffer
//! once the syscall returned.

use bytes::{Buf, Bytes};
use std::{fmt, io::IoSlice};

/// Result type for operations that return both a result and the buffers
/// they were given.
pub type BufResult<T, B> = (std::io::Result<T>, B);

/// The connection's fixed-capacity primary write buffer.
pub struct PrimaryBuffer {
  buf: Box<[u8]>,
  len: usize,
  pos: usize,
}

impl PrimaryBuffer {
  /// Allocates a zeroed buffer of `cap` bytes.
  ///
  /// # Panics
  ///
  /// Panics if `cap` is 0.
  pub fn with_capacity(cap: usize) -> Self {
    assert!(cap > 0, "PrimaryBuffer::with_capacity: capacity must be non-zero");
    Self { buf: vec![0u8; cap].into_boxed_slice(), len: 0, pos: 0 }
  }

  pub fn capacity(&self) -> usize {
    self.buf.len()
  }

  /// Bytes that can still be appended.
  pub fn spare(&self) -> usize {
    self.buf.len() - self.len
  }

  pub fn is_full(&self) -> bool {
    self.len == self.buf.len()
  }

  /// Copies as much of `src` as fits and returns how many bytes were taken.
  pub fn transfer(&mut self, src: &[u8]) -> usize {
    if self.pos == self.len {
      self.clear();
    }

    let n = src.len().min(self.spare());
    self.buf[self.len..self.len + n].copy_from_slice(&src[..n]);
    self.len += n;
    n
  }

  /// Forgets all data, keeping the allocation.
  pub fn clear(&mut self) {
    self.len = 0;
    self.pos = 0;
  }

  /// Clears the buffer and overwrites its memory.
  #[cfg(feature = "zeroize")]
  pub(crate) fn wipe(&mut self) {
    use zeroize::Zeroize;

    self.buf.zeroize();
    self.clear();
  }
}

impl Buf for PrimaryBuffer {
  fn remaining(&self) -> usize {
    self.len - self.pos
  }

  fn chunk(&self) -> &[u8] {
    &self.buf[self.pos..self.len]
  }

  fn advance(&mut self, cnt: usize) {
    let remaining = self.len - self.pos;
    assert!(
      cnt <= remaining,
      "PrimaryBuffer::advance: cannot advance by {} bytes, only {} remaining",
      cnt,
      remaining
    );

    self.pos += cnt;
  }
}

impl fmt::Debug for PrimaryBuffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PrimaryBuffer")
      .field("capacity", &self.buf.len())
      .field("len", &self.len)
      .field("pos", &self.pos)
      .finish()
  }
}

/// One buffer of a write operation.
#[derive(Debug)]
pub enum WriteBuf {
  Primary(PrimaryBuffer),
  Chunk(Bytes),
}

impl WriteBuf {
  pub fn is_primary(&self) -> bool {
    matches!(self, WriteBuf::Primary(_))
  }

  pub fn into_primary(self) -> Option<PrimaryBuffer> {
    match self {
      WriteBuf::Primary(primary) => Some(primary),
      WriteBuf::Chunk(_) => None,
    }
  }
}

impl Buf for WriteBuf {
  fn remaining(&self) -> usize {
    match self {
      WriteBuf::Primary(primary) => primary.remaining(),
      WriteBuf::Chunk(chunk) => chunk.remaining(),
    }
  }

  fn chunk(&self) -> &[u8] {
    match self {
      WriteBuf::Primary(primary) => primary.chunk(),
      WriteBuf::Chunk(chunk) => chunk.chunk(),
    }
  }

  fn advance(&mut self, cnt: usize) {
    match self {
      WriteBuf::Primary(primary) => primary.advance(cnt),
      WriteBuf::Chunk(chunk) => chunk.advance(cnt),
    }
  }
}

/// Total bytes not yet written across `bufs`.
pub fn remaining_in(bufs: &[WriteBuf]) -> usize {
  bufs.iter().map(Buf::remaining).sum()
}

/// Slices for a gathering syscall, in order, skipping empty buffers.
pub fn io_slices(bufs: &[WriteBuf]) -> Vec<IoSlice<'_>> {
  bufs
    .iter()
    .filter(|buf| buf.has_remaining())
    .map(|buf| IoSlice::new(buf.chunk()))
    .collect()
}

/// Consumes `written` bytes front to back across `bufs`.
///
/// The transport cannot have written bytes it was never given. Debug builds
/// assert on that, release builds clamp the count.
pub(crate) fn advance_all(bufs: &mut [WriteBuf], written: usize) {
  let mut left = written;
  for buf in bufs.iter_mut() {
    if left == 0 {
      break;
    }
    let step = left.min(buf.remaining());
    buf.advance(step);
    left -= step;
  }
  debug_assert_eq!(left, 0, "transport reported more bytes than it was given");
}
