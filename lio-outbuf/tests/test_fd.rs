#![cfg(unix)]

use lio_outbuf::{
  Config, Error, Event, Mode, OutputBuffer, test_utils::RecordingNotifier,
  transport::fd::FdTransport,
};
use std::{
  io::Read,
  os::{fd::AsRawFd, unix::net::UnixStream},
  thread,
  time::Duration,
};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_fd_transport_delivers_in_order() {
  let (tx, mut rx) = UnixStream::pair().unwrap();
  let notifier = RecordingNotifier::new();
  let output = OutputBuffer::new(
    FdTransport::new(tx.as_raw_fd()).unwrap(),
    notifier.clone(),
    Config::new().buffer_size(1024),
  );

  let expected: Vec<u8> = (0..256 * 1024).map(|i| (i % 253) as u8).collect();
  let reader = thread::spawn(move || {
    let mut received = vec![0u8; 256 * 1024];
    rx.read_exact(&mut received).unwrap();
    received
  });

  for chunk in expected.chunks(3000) {
    output.add_data(chunk, Mode::NonBlocking).unwrap();
  }
  output.register_interest();

  assert!(notifier.wait_for(1, WAIT), "never became writable");
  assert!(matches!(notifier.events()[..], [Event::Writable]));
  assert_eq!(reader.join().unwrap(), expected);
  assert!(!output.has_data_to_write());
}

#[test]
fn test_fd_transport_blocking_flush() {
  let (tx, mut rx) = UnixStream::pair().unwrap();
  let output = OutputBuffer::new(
    FdTransport::new(tx.as_raw_fd()).unwrap(),
    RecordingNotifier::new(),
    Config::new().buffer_size(16),
  );

  output.add_data(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", Mode::Blocking).unwrap();
  assert!(!output.flush(Mode::Blocking).unwrap());

  let mut received = [0u8; 35];
  rx.read_exact(&mut received).unwrap();
  assert_eq!(&received, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
}

#[test]
fn test_fd_transport_peer_close_is_end_of_stream() {
  let (tx, rx) = UnixStream::pair().unwrap();
  drop(rx);
  let notifier = RecordingNotifier::new();
  let output = OutputBuffer::new(
    FdTransport::new(tx.as_raw_fd()).unwrap(),
    notifier.clone(),
    Config::new(),
  );

  output.add_data(b"nobody listens", Mode::NonBlocking).unwrap();

  assert!(notifier.wait_for(1, WAIT));
  assert!(matches!(notifier.events()[..], [Event::Error(Error::EndOfStream)]));
  assert!(matches!(output.flush(Mode::NonBlocking), Err(Error::EndOfStream)));
}
