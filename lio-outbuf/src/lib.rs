#![cfg_attr(docsrs, feature(doc_cfg))]

//! # lio-outbuf - Write Buffering for Completion-Based Sockets
//!
//! `lio-outbuf` sits between a producer of response bytes and a socket whose
//! writes complete asynchronously. It accepts data in blocking or
//! non-blocking mode, coalesces it, and drains it through a [`Transport`]
//! with at most one asynchronous write in flight per connection.
//!
//! ## Features
//! - **Ordered output**: bytes reach the transport exactly in the order they
//!   were added, even while a write is in flight.
//! - **Coalescing**: data queued behind an in-flight write goes out in one
//!   gathering write.
//! - **Readiness notification**: the upper layer registers interest and is
//!   told once the connection can take more data, never while it is still
//!   inside the call that started the write.
//! - **Sticky errors**: the first failed write is kept and reported to every
//!   later flush until the connection is recycled.
//!
//! ## Quick Start
//!
//! ```rust
//! use lio_outbuf::{Config, Event, Mode, OutputBuffer, transport::inline::InlineTransport};
//!
//! let transport = InlineTransport::new(Vec::new());
//! let output = OutputBuffer::new(transport, |event: Event| {
//!   println!("connection event: {event:?}");
//! }, Config::new());
//!
//! output.add_data(b"HTTP/1.1 200 OK\r\n\r\n", Mode::NonBlocking)?;
//! let pending = output.flush(Mode::NonBlocking)?;
//! assert!(!pending);
//! # Ok::<(), lio_outbuf::Error>(())
//! ```
//!
//! ## Transports
//!
//! | Transport                                   | Completes on          |
//! |---------------------------------------------|-----------------------|
//! | [`FdTransport`](transport::fd::FdTransport) | a writer thread (unix) |
//! | [`InlineTransport`](transport::inline::InlineTransport) | the calling thread |
//!
//! Anything implementing [`Transport`] can be plugged in instead.
//!
//! ## Threading
//!
//! A connection has one producer. Completions run on whatever thread the
//! transport calls back on, and notifications are delivered from there, with
//! no lock of the connection held.

#[macro_use]
mod macros;

pub mod buf;
pub mod config;
pub mod error;
pub mod notify;
pub mod permit;
pub mod transport;

mod completion;
mod inline;
mod output;
mod store;
mod sync;

#[doc(hidden)]
pub mod test_utils;

pub use buf::{BufResult, WriteBuf};
pub use config::Config;
pub use error::{Error, Result};
pub use notify::{Event, Notify};
pub use output::{Mode, OutputBuffer};
pub use transport::Transport;
