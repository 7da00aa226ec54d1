//! Test utilities for unit and integration tests.
//!
//! [`MockTransport`] parks every write until the test completes it, from any
//! thread, with whatever outcome it wants. [`RecordingNotifier`] records the
//! events a connection delivers.

use std::{
  collections::VecDeque,
  io,
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::{Duration, Instant},
};

use bytes::Buf;

use crate::{
  Error,
  buf::{self, WriteBuf},
  notify::{Event, Notify},
  sync::{Condvar, Mutex},
  transport::{Callback, Transport},
};

#[derive(Default)]
struct Shared {
  queue: Mutex<VecDeque<PendingOp>>,
  arrived: Condvar,
  written: Mutex<Vec<u8>>,
  issued: AtomicUsize,
  gathering: AtomicUsize,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
  auto: AtomicBool,
}

/// Transport whose writes complete when the test says so.
///
/// Clones share state, so a test keeps one handle and gives another to the
/// connection.
#[doc(hidden)]
#[derive(Clone, Default)]
pub struct MockTransport {
  shared: Arc<Shared>,
}

impl MockTransport {
  /// Every write waits in the queue for [`next`](Self::next).
  pub fn new() -> Self {
    Self::default()
  }

  /// Every write completes in full, inline, before `write` returns.
  pub fn auto() -> Self {
    let transport = Self::default();
    transport.set_auto(true);
    transport
  }

  pub fn set_auto(&self, auto: bool) {
    self.shared.auto.store(auto, Ordering::SeqCst);
  }

  /// Waits up to `timeout` for the next issued write.
  pub fn next(&self, timeout: Duration) -> Option<PendingOp> {
    let deadline = Instant::now() + timeout;
    let mut queue = self.shared.queue.lock();
    loop {
      if let Some(op) = queue.pop_front() {
        return Some(op);
      }
      let now = Instant::now();
      if now >= deadline {
        return None;
      }
      let (next, _) = self.shared.arrived.wait_timeout(queue, deadline - now);
      queue = next;
    }
  }

  pub fn try_next(&self) -> Option<PendingOp> {
    self.shared.queue.lock().pop_front()
  }

  /// Writes waiting for completion.
  pub fn queued(&self) -> usize {
    self.shared.queue.lock().len()
  }

  /// Every byte reported as written so far, in completion order.
  pub fn written(&self) -> Vec<u8> {
    self.shared.written.lock().clone()
  }

  /// Writes issued so far, single and gathering.
  pub fn issued(&self) -> usize {
    self.shared.issued.load(Ordering::SeqCst)
  }

  pub fn gathering_writes(&self) -> usize {
    self.shared.gathering.load(Ordering::SeqCst)
  }

  /// Most writes that were ever outstanding at the same time.
  pub fn max_in_flight(&self) -> usize {
    self.shared.max_in_flight.load(Ordering::SeqCst)
  }

  fn submit(&self, done: Done) {
    let shared = &self.shared;
    shared.issued.fetch_add(1, Ordering::SeqCst);
    if matches!(done, Done::Gather(..)) {
      shared.gathering.fetch_add(1, Ordering::SeqCst);
    }
    let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    shared.max_in_flight.fetch_max(now, Ordering::SeqCst);

    let op = PendingOp { done, shared: Arc::clone(shared) };
    if shared.auto.load(Ordering::SeqCst) {
      return op.complete_all();
    }

    shared.queue.lock().push_back(op);
    shared.arrived.notify_all();
  }
}

impl Transport for MockTransport {
  fn write(&self, buf: WriteBuf, _timeout: Duration, done: Callback<WriteBuf>) {
    self.submit(Done::Single(buf, done));
  }

  fn write_vectored(
    &self,
    bufs: Vec<WriteBuf>,
    _timeout: Duration,
    done: Callback<Vec<WriteBuf>>,
  ) {
    self.submit(Done::Gather(bufs, done));
  }
}

enum Done {
  Single(WriteBuf, Callback<WriteBuf>),
  Gather(Vec<WriteBuf>, Callback<Vec<WriteBuf>>),
}

/// A write the [`MockTransport`] has not completed yet.
#[doc(hidden)]
pub struct PendingOp {
  done: Done,
  shared: Arc<Shared>,
}

impl PendingOp {
  pub fn is_gathering(&self) -> bool {
    matches!(self.done, Done::Gather(..))
  }

  /// Buffers in the write.
  pub fn buffers(&self) -> usize {
    match &self.done {
      Done::Single(..) => 1,
      Done::Gather(bufs, _) => bufs.len(),
    }
  }

  /// Unwritten bytes the write carries.
  pub fn len(&self) -> usize {
    match &self.done {
      Done::Single(buf, _) => buf.remaining(),
      Done::Gather(bufs, _) => buf::remaining_in(bufs),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The bytes the write carries, in order.
  pub fn bytes(&self) -> Vec<u8> {
    match &self.done {
      Done::Single(buf, _) => buf.chunk().to_vec(),
      Done::Gather(bufs, _) => {
        bufs.iter().flat_map(|buf| buf.chunk().iter().copied()).collect()
      }
    }
  }

  /// Completes with a byte count. A positive count records that many bytes
  /// from the front as written; a negative one means the peer closed.
  pub fn complete(self, count: i64) {
    if count > 0 {
      let bytes = self.bytes();
      let end = (count as usize).min(bytes.len());
      self.shared.written.lock().extend_from_slice(&bytes[..end]);
    }
    self.finish(Ok(count));
  }

  /// Completes with every byte written.
  pub fn complete_all(self) {
    let len = self.len() as i64;
    self.complete(len);
  }

  pub fn fail(self, err: io::Error) {
    self.finish(Err(err));
  }

  fn finish(self, res: io::Result<i64>) {
    self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    match self.done {
      Done::Single(buf, done) => done((res, buf)),
      Done::Gather(bufs, done) => done((res, bufs)),
    }
  }
}

/// Notifier that records every event and attached error.
#[doc(hidden)]
#[derive(Clone, Default)]
pub struct RecordingNotifier {
  inner: Arc<Recorded>,
}

#[derive(Default)]
struct Recorded {
  events: Mutex<Vec<Event>>,
  arrived: Condvar,
  attached: Mutex<Vec<Error>>,
}

impl RecordingNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<Event> {
    self.inner.events.lock().clone()
  }

  pub fn writable_count(&self) -> usize {
    self.count(|event| matches!(event, Event::Writable))
  }

  pub fn error_count(&self) -> usize {
    self.count(Event::is_error)
  }

  /// Errors passed to [`Notify::attach_error`].
  pub fn attached(&self) -> Vec<Error> {
    self.inner.attached.lock().clone()
  }

  /// Waits up to `timeout` until at least `n` events were recorded.
  pub fn wait_for(&self, n: usize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut events = self.inner.events.lock();
    while events.len() < n {
      let now = Instant::now();
      if now >= deadline {
        return false;
      }
      let (next, _) = self.inner.arrived.wait_timeout(events, deadline - now);
      events = next;
    }
    true
  }

  fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
    self.inner.events.lock().iter().filter(|&event| pred(event)).count()
  }
}

impl Notify for RecordingNotifier {
  fn notify(&self, event: Event) {
    self.inner.events.lock().push(event);
    self.inner.arrived.notify_all();
  }

  fn attach_error(&self, error: &Error) {
    self.inner.attached.lock().push(error.clone());
  }
}
