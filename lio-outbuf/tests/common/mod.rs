#![allow(dead_code)]

use lio_outbuf::{
  Config, OutputBuffer,
  test_utils::{MockTransport, RecordingNotifier},
};
use std::time::Duration;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub type MockOutput = OutputBuffer<MockTransport, RecordingNotifier>;

/// A connection over a manual [`MockTransport`].
pub fn mock_output(config: Config) -> (MockOutput, MockTransport, RecordingNotifier) {
  let transport = MockTransport::new();
  let notifier = RecordingNotifier::new();
  let output = OutputBuffer::new(transport.clone(), notifier.clone(), config);
  (output, transport, notifier)
}

/// Deterministic payload of `len` bytes derived from `seed`.
pub fn payload(len: usize, seed: u64) -> Vec<u8> {
  (0..len).map(|i| (seed.wrapping_add(i as u64) % 251) as u8).collect()
}

/// Completes writes until none arrives within `idle`.
pub fn drain(transport: &MockTransport, idle: Duration) {
  while let Some(op) = transport.next(idle) {
    op.complete_all();
  }
}
