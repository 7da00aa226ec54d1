use std::{fmt, sync::Arc};

use bytes::Buf;
use crossbeam_channel::RecvTimeoutError;

use crate::{
  Config, Error, Result,
  buf::WriteBuf,
  completion::{InFlight, PendingWrite},
  inline::IssueMarker,
  notify::{Event, Notify},
  permit::{PermitGuard, WritePermit},
  store::BufferStore,
  sync::Mutex,
  transport::Transport,
};

/// How a call may behave when the transport cannot take data right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  /// Wait for in-flight writes and write synchronously, bounded by the
  /// configured timeout.
  Blocking,
  /// Never wait for the transport. Data that cannot be sent now is queued.
  NonBlocking,
}

/// The write side of one connection.
///
/// Accepts bytes from a single producer, keeps them in a fixed-size primary
/// buffer plus an overflow queue, and drains them through a completion-based
/// [`Transport`] with at most one asynchronous write in flight. Bytes reach
/// the transport in exactly the order they were added.
///
/// All methods take `&self`; completions update the buffer from transport
/// threads.
pub struct OutputBuffer<T, N> {
  inner: Arc<Inner<T, N>>,
}

pub(crate) struct Inner<T, N> {
  pub(crate) config: Config,
  pub(crate) transport: T,
  pub(crate) notifier: N,
  pub(crate) permit: Arc<WritePermit>,
  pub(crate) state: Mutex<State>,
}

pub(crate) struct State {
  pub(crate) store: BufferStore,
  /// First failure seen by a completion. Sticky until `recycle`.
  pub(crate) error: Option<Error>,
  /// The producer wants a writable notification.
  pub(crate) interest: bool,
}

/// How non-blocking data gets into the buffer.
enum Admission {
  /// No write in flight: the caller holds the permit and writes now.
  Direct(PermitGuard),
  /// Parked behind the in-flight write.
  Queued,
  /// The overflow queue is at its limit.
  Full { buffered: usize, limit: usize },
}

impl<T, N> OutputBuffer<T, N>
where
  T: Transport,
  N: Notify,
{
  pub fn new(transport: T, notifier: N, config: Config) -> Self {
    let state = State {
      store: BufferStore::new(config.get_buffer_size()),
      error: None,
      interest: false,
    };

    Self {
      inner: Arc::new(Inner {
        config,
        transport,
        notifier,
        permit: WritePermit::new(),
        state: Mutex::new(state),
      }),
    }
  }

  /// Appends `src` to the outgoing stream.
  ///
  /// In [`Mode::Blocking`] the bytes are copied into the primary buffer,
  /// which is written out synchronously whenever it fills up. Bytes left in
  /// it afterwards wait for the next flush. While an asynchronous write is in
  /// flight or chunks are queued the bytes are queued instead, and the queue
  /// is flushed synchronously once it holds a buffer's worth.
  ///
  /// In [`Mode::NonBlocking`] the bytes are copied and an asynchronous write
  /// is started if none is in flight; otherwise they are queued behind it.
  /// Fails with the connection's stored error if an earlier write failed, and
  /// with [`Error::Overloaded`] if the queue limit is reached and the
  /// in-flight write does not finish within the timeout.
  ///
  /// The caller's memory is never retained.
  pub fn add_data(&self, src: &[u8], mode: Mode) -> Result<()> {
    if src.is_empty() {
      return Ok(());
    }

    match mode {
      Mode::Blocking => self.add_blocking(src),
      Mode::NonBlocking => self.add_non_blocking(src),
    }
  }

  /// Pushes buffered data towards the transport.
  ///
  /// Returns whether data is still pending afterwards. A blocking flush
  /// writes everything before returning and so always returns `false` on
  /// success. A non-blocking flush starts an asynchronous write if possible
  /// and returns [`has_data_to_write`](Self::has_data_to_write).
  ///
  /// Both fail right away with the stored error once a write has failed.
  pub fn flush(&self, mode: Mode) -> Result<bool> {
    self.inner.check_error()?;

    match mode {
      Mode::Blocking => self.flush_blocking(),
      Mode::NonBlocking => Ok(self.inner.flush_non_blocking(None)),
    }
  }

  /// Whether anything is left to do: bytes held by the transport, an unsent
  /// or lent primary buffer, queued overflow, or a stored error the producer
  /// has not seen through a flush yet.
  pub fn has_data_to_write(&self) -> bool {
    self.inner.has_data_to_write()
  }

  /// Asks for a [`Event::Writable`] notification once the in-flight write
  /// chain finishes. Without a write in flight the notification is sent
  /// right away.
  pub fn register_interest(&self) {
    let inner = &self.inner;
    let writable = {
      let mut state = inner.state.lock();
      if inner.permit.is_held() {
        state.interest = true;
        false
      } else {
        true
      }
    };

    if writable {
      inner.notifier.notify(Event::Writable);
    }
  }

  /// Starts a new request on the connection: clears write interest.
  pub fn reset(&self) {
    self.inner.state.lock().interest = false;
  }

  /// Returns the connection to its pristine state for reuse: drops buffered
  /// data, clears the stored error and interest, and frees the write permit.
  /// A write still in flight completes into the void.
  pub fn recycle(&self) {
    let inner = &self.inner;
    let mut state = inner.state.lock();

    let _dropped = state.store.discard();
    state.store.ensure_primary();
    #[cfg(feature = "zeroize")]
    state.store.wipe();
    state.error = None;
    state.interest = false;
    inner.permit.reset();

    debug!(dropped = _dropped, "output buffer recycled");
  }

  /// Unsent bytes held by the connection, excluding a buffer that is lent to
  /// an in-flight write.
  pub fn buffered_bytes(&self) -> usize {
    self.inner.state.lock().store.buffered_bytes()
  }

  /// Whether an asynchronous write is in flight.
  pub fn is_write_pending(&self) -> bool {
    self.inner.permit.is_held()
  }

  /// The stored error, if a write failed.
  pub fn error(&self) -> Option<Error> {
    self.inner.state.lock().error.clone()
  }

  pub fn config(&self) -> &Config {
    &self.inner.config
  }

  fn add_blocking(&self, mut src: &[u8]) -> Result<()> {
    let inner = &self.inner;
    inner.check_error()?;

    while !src.is_empty() {
      let full = {
        let mut state = inner.state.lock();
        if state.store.has_pending() || inner.permit.is_held() {
          // Behind an in-flight write or queued chunks, bytes queue too.
          state.store.push_overflow(src);
          src = &[];
          state.store.overflow_len() >= inner.config.get_buffer_size()
        } else {
          let primary = state.store.ensure_primary();
          let taken = primary.transfer(src);
          src = &src[taken..];
          primary.is_full()
        }
      };

      if full {
        self.flush_blocking()?;
      }
    }
    Ok(())
  }

  fn add_non_blocking(&self, src: &[u8]) -> Result<()> {
    let inner = &self.inner;

    let admission = {
      let mut state = inner.state.lock();
      if let Some(err) = &state.error {
        return Err(err.clone());
      }

      match inner.permit.try_acquire() {
        Some(permit) => {
          state.store.ensure_primary();
          state.store.append(src);
          Admission::Direct(permit)
        }
        None => match inner.config.get_max_buffered() {
          Some(limit) if state.store.overflow_len() + src.len() > limit => {
            Admission::Full { buffered: state.store.overflow_len(), limit }
          }
          _ => {
            state.store.push_overflow(src);
            Admission::Queued
          }
        },
      }
    };

    let permit = match admission {
      Admission::Direct(permit) => permit,
      Admission::Queued => {
        trace!(bytes = src.len(), "write in flight, queued");
        return Ok(());
      }
      Admission::Full { buffered, limit } => {
        warn!(buffered, limit, "overflow queue full, waiting for in-flight write");
        let Some(permit) = inner.permit.acquire_timeout(inner.config.get_timeout())
        else {
          return Err(Error::Overloaded { buffered, limit });
        };

        let mut state = inner.state.lock();
        if let Some(err) = &state.error {
          return Err(err.clone());
        }
        state.store.ensure_primary();
        state.store.append(src);
        permit
      }
    };

    inner.flush_non_blocking(Some(permit));
    Ok(())
  }

  /// Writes the overflow queue, then the primary buffer, each to completion.
  fn flush_blocking(&self) -> Result<bool> {
    let inner = &self.inner;
    inner.await_in_flight();
    inner.check_error()?;

    let (chunks, primary) = {
      let mut state = inner.state.lock();
      (state.store.take_overflow(), state.store.take_primary_if_pending())
    };

    let mut chunks = chunks.into_iter();
    while let Some(chunk) = chunks.next() {
      if let Err((err, returned)) = inner.write_blocking(WriteBuf::Chunk(chunk)) {
        let unsent = match returned {
          Some(WriteBuf::Chunk(rest)) if rest.has_remaining() => Some(rest),
          _ => None,
        };

        let mut state = inner.state.lock();
        let primary = primary.and_then(|primary| state.store.unload(primary));
        state.store.requeue_front(unsent.into_iter().chain(chunks).chain(primary));
        state.store.ensure_primary();
        return Err(err);
      }
    }

    if let Some(primary) = primary {
      let res = inner.write_blocking(WriteBuf::Primary(primary));

      let mut state = inner.state.lock();
      match res {
        Ok(buf) => state.store.reclaim(buf),
        Err((err, returned)) => {
          let unsent = returned
            .and_then(WriteBuf::into_primary)
            .and_then(|primary| state.store.unload(primary));
          state.store.requeue_front(unsent.into_iter());
          state.store.ensure_primary();
          return Err(err);
        }
      }
    }

    inner.state.lock().store.ensure_primary();
    Ok(false)
  }
}

impl<T, N> Inner<T, N>
where
  T: Transport,
  N: Notify,
{
  fn check_error(&self) -> Result<()> {
    match &self.state.lock().error {
      Some(err) => Err(err.clone()),
      None => Ok(()),
    }
  }

  fn has_data_to_write(&self) -> bool {
    let state = self.state.lock();
    self.transport.has_pending()
      || state.store.primary_pending()
      || state.store.has_pending()
      || state.error.is_some()
  }

  /// Waits up to the timeout for the in-flight write to finish. A wait that
  /// runs out is ignored and the caller proceeds without the permit.
  fn await_in_flight(&self) {
    if !self.permit.is_held() {
      return;
    }
    if self.permit.acquire_timeout(self.config.get_timeout()).is_none() {
      warn!(
        timeout = ?self.config.get_timeout(),
        "in-flight write still pending, continuing without the permit"
      );
    }
  }

  /// Starts an asynchronous write of everything buffered, if no write is in
  /// flight. `permit` is passed by callers that already acquired it.
  fn flush_non_blocking(self: &Arc<Self>, permit: Option<PermitGuard>) -> bool {
    let started = {
      let mut state = self.state.lock();
      let permit = permit.or_else(|| self.permit.try_acquire());

      match permit {
        Some(permit) => {
          let write = if state.store.has_pending() {
            Some(PendingWrite::Gather(state.store.drain(None)))
          } else {
            state
              .store
              .take_primary_if_pending()
              .map(|primary| PendingWrite::Single(WriteBuf::Primary(primary)))
          };
          // Nothing to send: the permit is dropped here, still under the lock.
          write.map(|write| (write, permit))
        }
        None => None,
      }
    };

    if let Some((write, permit)) = started {
      let marker = IssueMarker::new();
      let _inline = marker.enter();
      self.issue(write, InFlight { permit, marker: marker.clone() });
    }

    self.has_data_to_write()
  }

  /// Writes `buf` to completion, waiting up to the timeout for each transport
  /// round trip. On failure the buffer comes back if the transport returned
  /// it.
  fn write_blocking(
    &self,
    mut buf: WriteBuf,
  ) -> std::result::Result<WriteBuf, (Error, Option<WriteBuf>)> {
    let timeout = self.config.get_timeout();

    while buf.has_remaining() {
      let (tx, rx) = crossbeam_channel::bounded(1);
      self.transport.write(
        buf,
        timeout,
        Box::new(move |done| {
          let _ = tx.send(done);
        }),
      );

      let (res, returned) = match rx.recv_timeout(timeout) {
        Ok(done) => done,
        Err(RecvTimeoutError::Timeout) => {
          warn!(?timeout, "blocking write timed out");
          return Err((Error::Timeout, None));
        }
        Err(RecvTimeoutError::Disconnected) => {
          return Err((
            Error::other("transport dropped a blocking write without completing it"),
            None,
          ));
        }
      };
      buf = returned;

      match res {
        Ok(n) if n < 0 => return Err((Error::EndOfStream, Some(buf))),
        Ok(n) => {
          let step = (n as usize).min(buf.remaining());
          buf.advance(step);
        }
        Err(err) => return Err((Error::from(err), Some(buf))),
      }
    }

    Ok(buf)
  }
}

impl<T, N> fmt::Debug for OutputBuffer<T, N> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("OutputBuffer")
      .field("buffered", &state.store.buffered_bytes())
      .field("queued_chunks", &state.store.overflow_chunks())
      .field("primary_lent", &state.store.primary_is_lent())
      .field("write_pending", &self.inner.permit.is_held())
      .field("interest", &state.interest)
      .field("error", &state.error)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_utils::{MockTransport, RecordingNotifier};
  use std::time::Duration;

  const WAIT: Duration = Duration::from_secs(5);

  fn output(
    transport: &MockTransport,
    config: Config,
  ) -> (OutputBuffer<MockTransport, RecordingNotifier>, RecordingNotifier) {
    let notifier = RecordingNotifier::new();
    (OutputBuffer::new(transport.clone(), notifier.clone(), config), notifier)
  }

  #[test]
  fn non_blocking_add_starts_single_write() {
    let transport = MockTransport::new();
    let (output, _) = output(&transport, Config::new());

    output.add_data(b"hello", Mode::NonBlocking).unwrap();

    let op = transport.next(WAIT).expect("write issued");
    assert!(!op.is_gathering());
    assert_eq!(op.bytes(), b"hello");
    assert!(output.is_write_pending());
    assert!(output.has_data_to_write());

    op.complete_all();
    assert!(!output.is_write_pending());
    assert!(!output.has_data_to_write());
    assert_eq!(transport.written(), b"hello");
  }

  #[test]
  fn data_added_during_write_is_coalesced() {
    let transport = MockTransport::new();
    let (output, _) = output(&transport, Config::new());

    output.add_data(b"one ", Mode::NonBlocking).unwrap();
    output.add_data(b"two ", Mode::NonBlocking).unwrap();
    output.add_data(b"three", Mode::NonBlocking).unwrap();
    assert_eq!(transport.issued(), 1);

    transport.next(WAIT).unwrap().complete_all();

    let op = transport.next(WAIT).expect("continuation issued");
    assert!(op.is_gathering());
    assert_eq!(op.buffers(), 2);
    op.complete_all();

    assert_eq!(transport.written(), b"one two three");
    assert_eq!(transport.max_in_flight(), 1);
    assert!(!output.has_data_to_write());
  }

  #[test]
  fn partial_write_reissues_remainder() {
    let transport = MockTransport::new();
    let (output, _) = output(&transport, Config::new());

    output.add_data(b"abcdef", Mode::NonBlocking).unwrap();
    transport.next(WAIT).unwrap().complete(2);

    let op = transport.next(WAIT).expect("remainder issued");
    assert!(!op.is_gathering());
    assert_eq!(op.bytes(), b"cdef");
    op.complete_all();

    assert_eq!(transport.written(), b"abcdef");
  }

  #[test]
  fn add_larger_than_primary_spills_into_same_write() {
    let transport = MockTransport::new();
    let (output, _) = output(&transport, Config::new().buffer_size(4));

    output.add_data(b"0123456789", Mode::NonBlocking).unwrap();

    let op = transport.next(WAIT).unwrap();
    assert!(op.is_gathering());
    assert_eq!(op.bytes(), b"0123456789");
    op.complete_all();
    assert!(!output.has_data_to_write());
  }

  #[test]
  fn non_blocking_flush_without_data_releases_permit() {
    let transport = MockTransport::new();
    let (output, _) = output(&transport, Config::new());

    assert!(!output.flush(Mode::NonBlocking).unwrap());
    assert!(!output.is_write_pending());
    assert_eq!(transport.issued(), 0);
  }

  #[test]
  fn blocking_flush_writes_chunks_then_primary() {
    let transport = MockTransport::auto();
    let (output, _) = output(&transport, Config::new().buffer_size(16));

    {
      let mut state = output.inner.state.lock();
      state.store.push_overflow(b"aa");
      state.store.push_overflow(b"bb");
      state.store.push_overflow(b"cc");
      state.store.transfer(b"dd");
    }

    assert!(!output.flush(Mode::Blocking).unwrap());

    assert_eq!(transport.written(), b"aabbccdd");
    assert_eq!(transport.issued(), 4);
    assert_eq!(transport.gathering_writes(), 0);
    assert!(!output.has_data_to_write());
  }

  #[test]
  fn blocking_flush_error_requeues_unsent_bytes_in_order() {
    let transport = MockTransport::new();
    let (output, _) = output(&transport, Config::new());

    {
      let mut state = output.inner.state.lock();
      state.store.push_overflow(b"first");
      state.store.push_overflow(b"second");
      state.store.transfer(b"tail");
    }

    let driver = transport.clone();
    let completer = std::thread::spawn(move || {
      driver.next(WAIT).unwrap().complete(2);
      driver
        .next(WAIT)
        .unwrap()
        .fail(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
    });

    let err = output.flush(Mode::Blocking).unwrap_err();
    completer.join().unwrap();

    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    assert!(output.error().is_none(), "blocking failures are not stored");
    assert_eq!(output.buffered_bytes(), "rst".len() + "second".len() + "tail".len());

    // The primary buffer's bytes now queue behind the chunks.
    output.add_data(b"!", Mode::Blocking).unwrap();
    transport.set_auto(true);
    output.flush(Mode::NonBlocking).unwrap();
    assert_eq!(transport.written(), b"firstsecondtail!");
  }

  #[test]
  fn failed_primary_write_keeps_unsent_tail() {
    let transport = MockTransport::new();
    let (output, _) = output(&transport, Config::new());
    output.add_data(b"abcdef", Mode::Blocking).unwrap();

    let driver = transport.clone();
    let completer = std::thread::spawn(move || {
      driver.next(WAIT).unwrap().complete(2);
      driver
        .next(WAIT)
        .unwrap()
        .fail(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
    });

    output.flush(Mode::Blocking).unwrap_err();
    completer.join().unwrap();

    assert_eq!(output.buffered_bytes(), 4);
    assert_eq!(output.inner.state.lock().store.overflow_chunks(), 1);

    transport.set_auto(true);
    assert!(!output.flush(Mode::Blocking).unwrap());
    assert_eq!(transport.written(), b"abcdef");
  }

  #[test]
  fn blocking_add_does_not_wait_for_stalled_write() {
    let transport = MockTransport::new();
    let timeout = Duration::from_millis(300);
    let (output, _) = output(&transport, Config::new().timeout(timeout));

    output.add_data(b"w1", Mode::NonBlocking).unwrap();
    output.add_data(b"c1", Mode::NonBlocking).unwrap();

    let started = std::time::Instant::now();
    output.add_data(b"pp", Mode::Blocking).unwrap();
    output.add_data(b"qq", Mode::Blocking).unwrap();
    assert!(started.elapsed() < timeout);
    assert_eq!(output.buffered_bytes(), 6);

    transport.next(WAIT).unwrap().complete_all();
    transport.next(WAIT).unwrap().complete_all();
    assert_eq!(transport.written(), b"w1c1ppqq");
    assert!(!output.has_data_to_write());
  }

  #[test]
  fn blocking_add_flushes_full_buffer() {
    let transport = MockTransport::auto();
    let (output, _) = output(&transport, Config::new().buffer_size(4));

    output.add_data(b"abcdefghij", Mode::Blocking).unwrap();

    assert_eq!(transport.written(), b"abcdefgh");
    assert_eq!(output.buffered_bytes(), 2);

    output.flush(Mode::Blocking).unwrap();
    assert_eq!(transport.written(), b"abcdefghij");
  }

  #[test]
  fn blocking_write_times_out() {
    let transport = MockTransport::new();
    let config = Config::new().timeout(Duration::from_millis(20));
    let (output, _) = output(&transport, config);

    output.add_data(b"stuck", Mode::Blocking).unwrap();
    let err = output.flush(Mode::Blocking).unwrap_err();

    assert!(matches!(err, Error::Timeout));
    // The buffer is still with the transport; a fresh one takes new data.
    output.add_data(b"more", Mode::Blocking).unwrap();
    assert_eq!(output.buffered_bytes(), 4);
  }

  #[test]
  fn recycle_detaches_in_flight_write() {
    let transport = MockTransport::new();
    let (output, notifier) = output(&transport, Config::new());

    output.add_data(b"old", Mode::NonBlocking).unwrap();
    output.add_data(b"queued", Mode::NonBlocking).unwrap();
    output.register_interest();
    let stale = transport.next(WAIT).unwrap();

    output.recycle();
    assert!(!output.is_write_pending());
    assert!(!output.has_data_to_write());

    output.add_data(b"new", Mode::NonBlocking).unwrap();
    let fresh = transport.next(WAIT).unwrap();

    stale.complete_all();
    assert!(output.is_write_pending(), "stale completion left the new write alone");
    assert_eq!(transport.queued(), 0);

    fresh.complete_all();
    assert!(!output.has_data_to_write());
    assert_eq!(notifier.events().len(), 0);
  }
}
