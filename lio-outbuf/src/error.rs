use std::{fmt, io, sync::Arc};

/// Failure of a write on a connection.
///
/// Errors observed by a completion are stored on the connection and handed
/// out again by every later flush, so the type is cheap to clone.
#[derive(Debug, Clone)]
pub enum Error {
  /// The peer closed the connection during a write (negative byte count).
  EndOfStream,
  /// The write did not finish before the connection's timeout.
  Timeout,
  /// The overflow queue is at its limit and the in-flight write did not
  /// finish in time to make room.
  Overloaded { buffered: usize, limit: usize },
  /// Any other transport failure.
  Transport(Arc<io::Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  /// Wraps a failure that did not originate as an [`io::Error`].
  pub fn other<E>(cause: E) -> Self
  where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
  {
    let cause = cause.into();
    match cause.downcast::<io::Error>() {
      Ok(io_err) => Self::from(*io_err),
      Err(cause) => Self::Transport(Arc::new(io::Error::other(cause))),
    }
  }

  pub fn kind(&self) -> io::ErrorKind {
    match self {
      Self::EndOfStream => io::ErrorKind::UnexpectedEof,
      Self::Timeout => io::ErrorKind::TimedOut,
      Self::Overloaded { .. } => io::ErrorKind::WouldBlock,
      Self::Transport(err) => err.kind(),
    }
  }
}

impl From<io::Error> for Error {
  fn from(err: io::Error) -> Self {
    match err.kind() {
      io::ErrorKind::TimedOut => Self::Timeout,
      io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => {
        Self::EndOfStream
      }
      _ => Self::Transport(Arc::new(err)),
    }
  }
}

impl From<Error> for io::Error {
  fn from(err: Error) -> Self {
    io::Error::new(err.kind(), err)
  }
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::EndOfStream => f.write_str("connection closed by peer during write"),
      Self::Timeout => f.write_str("write timed out"),
      Self::Overloaded { buffered, limit } => write!(
        f,
        "write buffer overloaded: {buffered} bytes queued, limit is {limit}"
      ),
      Self::Transport(err) => write!(f, "write failed: {err}"),
    }
  }
}

impl std::error::Error for Error {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Transport(err) => Some(err.as_ref()),
      _ => None,
    }
  }
}
