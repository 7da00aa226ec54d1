use std::time::Duration;

/// Default size of the primary write buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default deadline for a single write and for permit waits.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default limit on bytes held in the overflow queue.
pub const DEFAULT_MAX_BUFFERED: usize = 1024 * 1024;

/// Per-connection settings of an [`OutputBuffer`](crate::OutputBuffer).
///
/// ```rust
/// use lio_outbuf::Config;
/// use std::time::Duration;
///
/// let config = Config::new()
///   .buffer_size(16 * 1024)
///   .timeout(Duration::from_secs(5))
///   .max_buffered(None);
/// assert_eq!(config.get_buffer_size(), 16 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  buffer_size: usize,
  timeout: Duration,
  max_buffered: Option<usize>,
}

impl Config {
  #[must_use]
  pub const fn new() -> Self {
    Self {
      buffer_size: DEFAULT_BUFFER_SIZE,
      timeout: DEFAULT_TIMEOUT,
      max_buffered: Some(DEFAULT_MAX_BUFFERED),
    }
  }

  /// Sets the capacity of the primary write buffer.
  ///
  /// # Panics
  ///
  /// Panics if `size` is 0.
  #[must_use]
  pub const fn buffer_size(mut self, size: usize) -> Self {
    assert!(size > 0, "buffer size must be non-zero");
    self.buffer_size = size;
    self
  }

  /// Sets the deadline passed to every transport write. Blocking flushes and
  /// permit waits use it too.
  #[must_use]
  pub const fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Sets how many bytes non-blocking writes may park in the overflow queue
  /// while a write is in flight. `None` disables the limit.
  ///
  /// Past the limit, a non-blocking `add_data` waits for the in-flight
  /// write instead of queuing more.
  #[must_use]
  pub const fn max_buffered(mut self, limit: Option<usize>) -> Self {
    self.max_buffered = limit;
    self
  }

  pub const fn get_buffer_size(&self) -> usize {
    self.buffer_size
  }

  pub const fn get_timeout(&self) -> Duration {
    self.timeout
  }

  pub const fn get_max_buffered(&self) -> Option<usize> {
    self.max_buffered
  }
}

impl Default for Config {
  fn default() -> Self {
    Self::new()
  }
}
