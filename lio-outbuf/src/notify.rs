use crate::Error;

/// Why a connection is being handed back to the upper layer.
#[derive(Debug, Clone)]
pub enum Event {
  /// Everything buffered has been written; the producer may write again.
  Writable,
  /// A write failed. The error is also stored on the connection.
  Error(Error),
}

impl Event {
  pub fn is_error(&self) -> bool {
    matches!(self, Event::Error(_))
  }
}

/// Hook the upper layer provides to get a connection rescheduled.
///
/// Called from completion callbacks, so on transport threads, never while
/// the connection's lock is held.
pub trait Notify: Send + Sync + 'static {
  fn notify(&self, event: Event);

  /// Records a failure on the exchange the failed write belonged to. Runs
  /// right before the [`Event::Error`] notification.
  fn attach_error(&self, error: &Error) {
    let _ = error;
  }
}

impl<F> Notify for F
where
  F: Fn(Event) + Send + Sync + 'static,
{
  fn notify(&self, event: Event) {
    self(event)
  }
}
