#[allow(unused_macros)]
macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) };
      if res == -1 {
          Err(std::io::Error::last_os_error())
      } else {
          Ok(res)
      }
  }};
}

// Logging goes through these so the `tracing` feature can compile it out.

macro_rules! trace {
  ($($arg:tt)*) => {
    #[cfg(feature = "tracing")]
    tracing::trace!($($arg)*);
  };
}

macro_rules! debug {
  ($($arg:tt)*) => {
    #[cfg(feature = "tracing")]
    tracing::debug!($($arg)*);
  };
}

macro_rules! warn {
  ($($arg:tt)*) => {
    #[cfg(feature = "tracing")]
    tracing::warn!($($arg)*);
  };
}
