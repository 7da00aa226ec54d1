//! Asynchronous write chain: issuing a write and reacting to its completion.
//!
//! A chain starts when a non-blocking flush obtains the write permit and ends
//! when everything buffered at that point (and everything queued meanwhile)
//! has been written, or when a write fails. The [`PermitGuard`] travels with
//! every write of the chain and is dropped while the connection's state lock
//! is held, so a producer registering interest always sees either the permit
//! still held (and gets notified by the chain) or already free.
//!
//! Transport calls are made without holding the state lock. Writes are issued
//! from a per-thread `drive` loop: a transport that completes inline hands
//! the continuation back to that loop instead of issuing it from inside its
//! own callback, so a chain of partial writes runs in constant stack depth.

use std::{cell::RefCell, collections::VecDeque, io, sync::Arc};

use bytes::Buf;

use crate::{
  Error,
  buf::{self, WriteBuf},
  inline::IssueMarker,
  notify::{Event, Notify},
  output::{Inner, State},
  permit::PermitGuard,
  sync::MutexGuard,
  transport::Transport,
};

pub(crate) enum PendingWrite {
  Single(WriteBuf),
  Gather(Vec<WriteBuf>),
}

/// What an in-flight write carries besides its buffers.
pub(crate) struct InFlight {
  pub(crate) permit: PermitGuard,
  pub(crate) marker: IssueMarker,
}

impl<T, N> Inner<T, N>
where
  T: Transport,
  N: Notify,
{
  pub(crate) fn issue(self: &Arc<Self>, write: PendingWrite, flight: InFlight) {
    let this = Arc::clone(self);
    drive(Box::new(move || this.start(write, flight)));
  }

  fn start(self: &Arc<Self>, write: PendingWrite, flight: InFlight) {
    let timeout = self.config.get_timeout();
    let this = Arc::clone(self);

    match write {
      PendingWrite::Single(buf) => {
        trace!(bytes = buf.remaining(), "issuing write");
        self.transport.write(
          buf,
          timeout,
          Box::new(move |(res, buf)| this.on_single(res, buf, flight)),
        );
      }
      PendingWrite::Gather(bufs) => {
        trace!(
          bytes = buf::remaining_in(&bufs),
          buffers = bufs.len(),
          "issuing gathering write"
        );
        self.transport.write_vectored(
          bufs,
          timeout,
          Box::new(move |(res, bufs)| this.on_gather(res, bufs, flight)),
        );
      }
    }
  }

  fn on_single(
    self: &Arc<Self>,
    res: io::Result<i64>,
    mut buf: WriteBuf,
    flight: InFlight,
  ) {
    let written = match written(res) {
      Ok(n) => n,
      Err(err) => return self.fail(err, vec![buf], flight),
    };
    trace!(written, "write completed");
    buf::advance_all(std::slice::from_mut(&mut buf), written);

    let mut state = self.state.lock();
    if !flight.permit.is_current() {
      trace!("connection recycled, dropping write completion");
      return;
    }

    let next = if state.store.has_follow_up() {
      PendingWrite::Gather(state.store.drain(Some(buf)))
    } else if buf.has_remaining() {
      PendingWrite::Single(buf)
    } else {
      state.store.reclaim(buf);
      return self.finish(state, flight);
    };

    drop(state);
    self.issue(next, flight);
  }

  fn on_gather(
    self: &Arc<Self>,
    res: io::Result<i64>,
    mut bufs: Vec<WriteBuf>,
    flight: InFlight,
  ) {
    let written = match written(res) {
      Ok(n) => n,
      Err(err) => return self.fail(err, bufs, flight),
    };
    trace!(written, buffers = bufs.len(), "gathering write completed");
    buf::advance_all(&mut bufs, written);

    let mut state = self.state.lock();
    if !flight.permit.is_current() {
      trace!("connection recycled, dropping write completion");
      return;
    }

    if state.store.has_follow_up() || bufs.iter().any(Buf::has_remaining) {
      let next = PendingWrite::Gather(state.store.drain(bufs));
      drop(state);
      return self.issue(next, flight);
    }

    for buf in bufs {
      state.store.reclaim(buf);
    }
    self.finish(state, flight);
  }

  /// Ends a chain that wrote everything. Releases the permit under the state
  /// lock, then notifies if a producer asked for it and is not still on the
  /// stack of the issuing call.
  fn finish(&self, mut state: MutexGuard<'_, State>, flight: InFlight) {
    let InFlight { permit, marker } = flight;

    let notify = state.interest && !marker.is_inline();
    if notify {
      state.interest = false;
    }
    drop(permit);
    drop(state);

    trace!(notify, "write chain finished");
    if notify {
      self.notifier.notify(Event::Writable);
    }
  }

  /// Ends a chain with an error. The error becomes sticky and whatever was
  /// still buffered is dropped, since nothing more can be written in order.
  fn fail(&self, err: Error, bufs: Vec<WriteBuf>, flight: InFlight) {
    {
      let mut state = self.state.lock();
      if !flight.permit.is_current() {
        trace!("connection recycled, dropping failed completion");
        return;
      }

      for buf in bufs {
        state.store.reclaim(buf);
      }
      let _dropped = state.store.discard();
      debug!(error = %err, dropped = _dropped, "write failed");

      state.error = Some(err.clone());
      state.interest = false;
      drop(flight.permit);
    }

    self.notifier.attach_error(&err);
    self.notifier.notify(Event::Error(err));
  }
}

type Job = Box<dyn FnOnce()>;

thread_local! {
  /// Writes waiting for the `drive` loop running on this thread.
  static DEFERRED: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

/// Runs `job`, then every job deferred while it ran, one after another.
///
/// If a loop is already running further up this thread's stack, `job` is
/// queued there and this returns at once.
fn drive(job: Job) {
  let job = DEFERRED.with(|deferred| match deferred.borrow_mut().as_mut() {
    Some(queue) => {
      queue.push_back(job);
      None
    }
    None => Some(job),
  });
  let Some(mut job) = job else {
    return;
  };

  let _running = Running::start();
  loop {
    job();
    let next = DEFERRED
      .with(|deferred| deferred.borrow_mut().as_mut().and_then(VecDeque::pop_front));
    match next {
      Some(next) => job = next,
      None => break,
    }
  }
}

/// Marks a `drive` loop as running on this thread until dropped.
struct Running;

impl Running {
  fn start() -> Self {
    DEFERRED.with(|deferred| *deferred.borrow_mut() = Some(VecDeque::new()));
    Running
  }
}

impl Drop for Running {
  fn drop(&mut self) {
    // Only non-empty after a panic. The queued writes release their permits.
    let left = DEFERRED.try_with(|deferred| deferred.borrow_mut().take());
    drop(left);
  }
}

/// Byte count of a completed write, or the error it ended with.
fn written(res: io::Result<i64>) -> Result<usize, Error> {
  match res {
    Ok(n) if n < 0 => Err(Error::EndOfStream),
    Ok(n) => Ok(n as usize),
    Err(err) => Err(Error::from(err)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{cell::Cell, rc::Rc};

  fn hop(left: usize, depth: Rc<Cell<usize>>, deepest: Rc<Cell<usize>>) {
    depth.set(depth.get() + 1);
    deepest.set(deepest.get().max(depth.get()));
    if left > 0 {
      let (d, m) = (Rc::clone(&depth), Rc::clone(&deepest));
      drive(Box::new(move || hop(left - 1, d, m)));
    }
    depth.set(depth.get() - 1);
  }

  #[test]
  fn nested_drive_keeps_constant_depth() {
    let depth = Rc::new(Cell::new(0));
    let deepest = Rc::new(Cell::new(0));

    let (d, m) = (Rc::clone(&depth), Rc::clone(&deepest));
    drive(Box::new(move || hop(100_000, d, m)));

    assert_eq!(depth.get(), 0);
    assert_eq!(deepest.get(), 1);
  }

  #[test]
  fn deferred_jobs_run_in_order_after_current() {
    let log = Rc::new(RefCell::new(Vec::new()));

    let outer = Rc::clone(&log);
    drive(Box::new(move || {
      for i in 0..3 {
        let log = Rc::clone(&outer);
        drive(Box::new(move || log.borrow_mut().push(i)));
      }
      outer.borrow_mut().push(99);
    }));

    assert_eq!(*log.borrow(), [99, 0, 1, 2]);
    assert!(DEFERRED.with(|deferred| deferred.borrow().is_none()));
  }
}
