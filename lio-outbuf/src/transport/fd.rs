//! [`Transport`] over a non-blocking unix file descriptor.
//!
//! Writes run on a dedicated worker thread fed through a channel, one job at
//! a time in submission order. Each job waits for `POLLOUT` within the write
//! timeout, makes a single `writev` (or `sendmsg` with `MSG_NOSIGNAL` on
//! Linux), and invokes the callback on the worker thread.
//!
//! Partial writes are reported as such. Retrying the remainder is the buffer
//! layer's job.

use std::{
  io::{self, IoSlice},
  os::fd::RawFd,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Sender, unbounded};

use super::{Callback, Transport};
use crate::buf::{self, WriteBuf};

/// Conservative `IOV_MAX`; POSIX only guarantees 16, every supported target
/// allows at least 1024.
const IOV_MAX: usize = 1024;

enum Job {
  Single { buf: WriteBuf, timeout: Duration, done: Callback<WriteBuf> },
  Gather { bufs: Vec<WriteBuf>, timeout: Duration, done: Callback<Vec<WriteBuf>> },
}

impl Job {
  fn run(self, fd: RawFd, queued: &AtomicUsize) {
    match self {
      Job::Single { buf, timeout, done } => {
        let res = write_to(fd, std::slice::from_ref(&buf), timeout);
        queued.fetch_sub(1, Ordering::AcqRel);
        done((res, buf));
      }
      Job::Gather { bufs, timeout, done } => {
        let res = write_to(fd, &bufs, timeout);
        queued.fetch_sub(1, Ordering::AcqRel);
        done((res, bufs));
      }
    }
  }

  /// Completes the job without touching the descriptor.
  fn abort(self, err: io::Error) {
    match self {
      Job::Single { buf, done, .. } => done((Err(err), buf)),
      Job::Gather { bufs, done, .. } => done((Err(err), bufs)),
    }
  }
}

pub struct FdTransport {
  fd: RawFd,
  jobs: Option<Sender<Job>>,
  queued: Arc<AtomicUsize>,
  worker: Option<JoinHandle<()>>,
}

impl FdTransport {
  /// Starts the worker thread for `fd`.
  ///
  /// The descriptor is borrowed, not owned: the caller keeps it open until
  /// the transport is dropped and closes it afterwards.
  pub fn new(fd: RawFd) -> io::Result<Self> {
    let (jobs, rx) = unbounded::<Job>();
    let queued = Arc::new(AtomicUsize::new(0));

    let worker_queued = Arc::clone(&queued);
    let worker = thread::Builder::new()
      .name(format!("lio-outbuf-fd{fd}"))
      .spawn(move || {
        for job in rx.iter() {
          job.run(fd, &worker_queued);
        }
        trace!(fd, "fd writer thread exiting");
      })?;

    debug!(fd, "started fd writer thread");
    Ok(Self { fd, jobs: Some(jobs), queued, worker: Some(worker) })
  }

  pub fn fd(&self) -> RawFd {
    self.fd
  }

  fn submit(&self, job: Job) {
    let Some(jobs) = self.jobs.as_ref() else {
      return job.abort(shut_down());
    };

    self.queued.fetch_add(1, Ordering::AcqRel);
    if let Err(err) = jobs.send(job) {
      self.queued.fetch_sub(1, Ordering::AcqRel);
      err.into_inner().abort(shut_down());
    }
  }
}

impl Transport for FdTransport {
  fn write(&self, buf: WriteBuf, timeout: Duration, done: Callback<WriteBuf>) {
    self.submit(Job::Single { buf, timeout, done });
  }

  fn write_vectored(
    &self,
    bufs: Vec<WriteBuf>,
    timeout: Duration,
    done: Callback<Vec<WriteBuf>>,
  ) {
    self.submit(Job::Gather { bufs, timeout, done });
  }

  fn has_pending(&self) -> bool {
    self.queued.load(Ordering::Acquire) > 0
  }
}

impl Drop for FdTransport {
  fn drop(&mut self) {
    // Closing the channel lets the worker finish queued jobs and exit.
    drop(self.jobs.take());

    let Some(worker) = self.worker.take() else { return };
    // The last handle can be dropped from a callback on the worker itself.
    if worker.thread().id() == thread::current().id() {
      return;
    }
    if worker.join().is_err() {
      warn!(fd = self.fd, "fd writer thread panicked");
    }
  }
}

fn shut_down() -> io::Error {
  io::Error::new(io::ErrorKind::BrokenPipe, "fd writer thread has shut down")
}

/// One write attempt. `Ok(-1)` when the peer is gone.
fn write_to(fd: RawFd, bufs: &[WriteBuf], timeout: Duration) -> io::Result<i64> {
  let slices = buf::io_slices(bufs);
  if slices.is_empty() {
    return Ok(0);
  }
  let slices = &slices[..slices.len().min(IOV_MAX)];

  wait_writable(fd, timeout)?;

  loop {
    match send_vectored(fd, slices) {
      Ok(n) => return Ok(n as i64),
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) if err.raw_os_error() == Some(libc::EPIPE) => return Ok(-1),
      Err(err) => return Err(err),
    }
  }
}

fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<()> {
  let deadline = Instant::now() + timeout;
  let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };

  loop {
    let left = deadline.saturating_duration_since(Instant::now());
    let millis = left.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    match syscall!(poll(&mut pfd, 1, millis)) {
      Ok(0) => {
        return Err(io::Error::new(
          io::ErrorKind::TimedOut,
          "descriptor not writable before the write timeout",
        ));
      }
      // POLLERR and POLLHUP surface through the write itself.
      Ok(_) => return Ok(()),
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => return Err(err),
    }
  }
}

#[cfg(linux)]
fn send_vectored(fd: RawFd, slices: &[IoSlice<'_>]) -> io::Result<usize> {
  // SAFETY: an all-zero msghdr is a valid empty message.
  let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
  // IoSlice is ABI compatible with iovec on unix.
  msg.msg_iov = slices.as_ptr() as *mut libc::iovec;
  msg.msg_iovlen = slices.len() as _;

  match syscall!(sendmsg(fd, &msg, libc::MSG_NOSIGNAL)) {
    Ok(n) => Ok(n as usize),
    Err(err) if err.raw_os_error() == Some(libc::ENOTSOCK) => writev(fd, slices),
    Err(err) => Err(err),
  }
}

#[cfg(not(linux))]
fn send_vectored(fd: RawFd, slices: &[IoSlice<'_>]) -> io::Result<usize> {
  writev(fd, slices)
}

fn writev(fd: RawFd, slices: &[IoSlice<'_>]) -> io::Result<usize> {
  syscall!(writev(
    fd,
    slices.as_ptr() as *const libc::iovec,
    slices.len() as libc::c_int
  ))
  .map(|n| n as usize)
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use std::os::fd::AsRawFd;
  use std::os::unix::net::UnixStream;

  fn chunk(data: &'static [u8]) -> WriteBuf {
    WriteBuf::Chunk(Bytes::from_static(data))
  }

  #[test]
  fn gathering_write_reaches_peer() {
    let (tx, mut rx) = UnixStream::pair().unwrap();
    let transport = FdTransport::new(tx.as_raw_fd()).unwrap();
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);

    transport.write_vectored(
      vec![chunk(b"hello "), chunk(b"world")],
      Duration::from_secs(5),
      Box::new(move |(res, bufs)| done_tx.send((res.unwrap(), bufs.len())).unwrap()),
    );

    let (written, count) = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(written, 11);
    assert_eq!(count, 2);

    let mut out = [0u8; 11];
    io::Read::read_exact(&mut rx, &mut out).unwrap();
    assert_eq!(&out, b"hello world");
  }

  #[test]
  fn closed_peer_reports_negative_count() {
    let (tx, rx) = UnixStream::pair().unwrap();
    drop(rx);
    let transport = FdTransport::new(tx.as_raw_fd()).unwrap();
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);

    transport.write(
      chunk(b"data"),
      Duration::from_secs(5),
      Box::new(move |(res, _)| done_tx.send(res.unwrap()).unwrap()),
    );

    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), -1);
  }

  #[test]
  fn full_socket_times_out() {
    let (tx, _rx) = UnixStream::pair().unwrap();
    tx.set_nonblocking(true).unwrap();
    // Fill the socket buffer so POLLOUT never fires.
    let filler = vec![0u8; 64 * 1024];
    while io::Write::write(&mut &tx, &filler).is_ok() {}

    let transport = FdTransport::new(tx.as_raw_fd()).unwrap();
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);

    transport.write(
      chunk(b"late"),
      Duration::from_millis(30),
      Box::new(move |(res, _)| done_tx.send(res.unwrap_err().kind()).unwrap()),
    );

    let kind = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(kind, io::ErrorKind::TimedOut);
  }

  #[test]
  fn pending_while_queued() {
    let (tx, _rx) = UnixStream::pair().unwrap();
    let transport = FdTransport::new(tx.as_raw_fd()).unwrap();
    assert!(!transport.has_pending());

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    transport.write(
      chunk(b"x"),
      Duration::from_secs(5),
      Box::new(move |(res, _)| done_tx.send(res.unwrap()).unwrap()),
    );
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!transport.has_pending());
  }
}
