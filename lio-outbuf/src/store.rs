//! Primary buffer plus the ordered overflow queue of a connection.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;

use crate::buf::{PrimaryBuffer, WriteBuf};

pub struct BufferStore {
  /// `None` while the buffer is lent to an in-flight write.
  primary: Option<PrimaryBuffer>,
  capacity: usize,
  overflow: VecDeque<Bytes>,
  overflow_len: usize,
}

impl BufferStore {
  pub fn new(capacity: usize) -> Self {
    Self {
      primary: Some(PrimaryBuffer::with_capacity(capacity)),
      capacity,
      overflow: VecDeque::new(),
      overflow_len: 0,
    }
  }

  /// Copies `src` into the primary buffer as far as it fits, the rest into
  /// a new overflow chunk. Once a chunk is queued everything goes to the
  /// queue, so the primary buffer never holds bytes newer than a chunk.
  pub fn append(&mut self, src: &[u8]) {
    let taken = if self.has_pending() { 0 } else { self.transfer(src) };
    if taken < src.len() {
      self.push_overflow(&src[taken..]);
    }
  }

  /// Copies what fits into the primary buffer. Takes nothing while the
  /// buffer is lent out.
  pub fn transfer(&mut self, src: &[u8]) -> usize {
    match self.primary.as_mut() {
      Some(primary) => primary.transfer(src),
      None => 0,
    }
  }

  pub fn push_overflow(&mut self, src: &[u8]) {
    if src.is_empty() {
      return;
    }
    self.overflow_len += src.len();
    self.overflow.push_back(Bytes::copy_from_slice(src));
  }

  /// Puts chunks back at the head of the queue, keeping their order.
  pub fn requeue_front(&mut self, chunks: impl DoubleEndedIterator<Item = Bytes>) {
    for chunk in chunks.rev() {
      self.overflow_len += chunk.remaining();
      self.overflow.push_front(chunk);
    }
  }

  /// Buffers for the next gathering write: `leftovers` that still hold
  /// bytes, then the primary buffer if it holds bytes, then the whole
  /// overflow queue in insertion order.
  ///
  /// A drained primary buffer among the leftovers goes back to the store.
  pub fn drain(
    &mut self,
    leftovers: impl IntoIterator<Item = WriteBuf>,
  ) -> Vec<WriteBuf> {
    let mut bufs = Vec::with_capacity(self.overflow.len() + 2);
    let primary = self.take_primary_if_pending();
    for buf in leftovers {
      if buf.has_remaining() {
        bufs.push(buf);
      } else {
        self.reclaim(buf);
      }
    }
    bufs.extend(primary.map(WriteBuf::Primary));
    bufs.extend(self.take_overflow().into_iter().map(WriteBuf::Chunk));
    bufs
  }

  pub fn take_overflow(&mut self) -> VecDeque<Bytes> {
    self.overflow_len = 0;
    std::mem::take(&mut self.overflow)
  }

  /// Takes the primary buffer if it holds unsent bytes.
  pub fn take_primary_if_pending(&mut self) -> Option<PrimaryBuffer> {
    match self.primary.as_ref() {
      Some(primary) if primary.has_remaining() => self.primary.take(),
      _ => None,
    }
  }

  #[cfg(test)]
  pub fn take_primary(&mut self) -> Option<PrimaryBuffer> {
    self.primary.take()
  }

  /// Returns a buffer that came back from the transport. A drained primary
  /// buffer is cleared for reuse; overflow chunks are dropped.
  pub fn reclaim(&mut self, buf: WriteBuf) {
    if let Some(mut primary) = buf.into_primary() {
      if !primary.has_remaining() {
        primary.clear();
      }
      self.restore_primary(primary);
    }
  }

  /// Moves the unsent bytes of a primary buffer that came back from a failed
  /// write into a chunk, and returns the emptied buffer to the store. The
  /// caller queues the chunk where the bytes belong.
  pub fn unload(&mut self, mut primary: PrimaryBuffer) -> Option<Bytes> {
    let unsent = primary
      .has_remaining()
      .then(|| Bytes::copy_from_slice(primary.chunk()));
    primary.clear();
    self.restore_primary(primary);
    unsent
  }

  /// Reinstalls the primary buffer. If a replacement was allocated while it
  /// was lent out, the returned one is dropped.
  pub fn restore_primary(&mut self, primary: PrimaryBuffer) {
    if self.primary.is_none() {
      self.primary = Some(primary);
    }
  }

  /// Makes sure a primary buffer is present, allocating a new one if the
  /// old one never came back.
  pub fn ensure_primary(&mut self) -> &mut PrimaryBuffer {
    let capacity = self.capacity;
    self.primary.get_or_insert_with(|| PrimaryBuffer::with_capacity(capacity))
  }

  pub fn primary_is_lent(&self) -> bool {
    self.primary.is_none()
  }

  /// Whether the primary buffer is lent out or still holds unsent bytes.
  pub fn primary_pending(&self) -> bool {
    self.primary.as_ref().is_none_or(Buf::has_remaining)
  }

  pub fn has_pending(&self) -> bool {
    !self.overflow.is_empty()
  }

  /// Whether a write chain has more to send: queued chunks, or bytes in a
  /// primary buffer that replaced the one lent to the chain.
  pub fn has_follow_up(&self) -> bool {
    self.has_pending() || self.primary.as_ref().is_some_and(Buf::has_remaining)
  }

  pub fn overflow_len(&self) -> usize {
    self.overflow_len
  }

  pub fn overflow_chunks(&self) -> usize {
    self.overflow.len()
  }

  /// Unsent bytes held by the store. A lent primary buffer counts as empty.
  pub fn buffered_bytes(&self) -> usize {
    self.primary.as_ref().map_or(0, Buf::remaining) + self.overflow_len
  }

  /// Drops everything that was not sent yet and returns the byte count.
  pub fn discard(&mut self) -> usize {
    let dropped = self.buffered_bytes();
    if let Some(primary) = self.primary.as_mut() {
      primary.clear();
    }
    self.take_overflow();
    dropped
  }

  #[cfg(feature = "zeroize")]
  pub fn wipe(&mut self) {
    if let Some(primary) = self.primary.as_mut() {
      primary.wipe();
    }
  }
}
