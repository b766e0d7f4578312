// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Crate-wide error type.
//!
//! Mirrors the error kinds a connection pooler's I/O core has to
//! distinguish (see the module-level docs on `stream` and `io_handle`):
//! transient syscall conditions never escape this type -- they are retried
//! inside the read/write loops -- everything else surfaces to the caller.

use std::error;
use std::fmt;
use std::io;

use openssl::ssl;

/// Failure modes exposed by the runtime and I/O facade.
#[derive(Debug)]
pub enum Error {
    /// A condition wait or framed read/write did not complete before its
    /// deadline.
    Timeout,
    /// The peer closed the connection in an orderly fashion mid-message.
    Closed,
    /// `ECONNRESET` / `EPIPE` or equivalent.
    Reset,
    /// A message failed header validation (see `protocol`).
    Protocol(String),
    /// TLS handshake or transport failure.
    Tls(String),
    /// Allocation of a message or readahead buffer failed.
    Oom,
    /// Cooperative cancellation was delivered at a suspension point.
    Cancelled,
    /// Poller, syscall, or internal invariant failure; fatal to the worker.
    Fatal(String),
    /// Wrapped OS error, used internally by read/write loops and surfaced
    /// unchanged when it isn't one of `EAGAIN`/`EWOULDBLOCK`/`EINTR`.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Timeout => write!(f, "timed out"),
            Error::Closed => write!(f, "connection closed by peer"),
            Error::Reset => write!(f, "connection reset"),
            Error::Protocol(ref msg) => write!(f, "protocol error: {}", msg),
            Error::Tls(ref msg) => write!(f, "tls error: {}", msg),
            Error::Oom => write!(f, "allocation failed"),
            Error::Cancelled => write!(f, "cancelled"),
            Error::Fatal(ref msg) => write!(f, "fatal: {}", msg),
            Error::Io(ref e) => write!(f, "io error: {}", e),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        match *self {
            Error::Timeout => "timed out",
            Error::Closed => "connection closed by peer",
            Error::Reset => "connection reset",
            Error::Protocol(_) => "protocol error",
            Error::Tls(_) => "tls error",
            Error::Oom => "allocation failed",
            Error::Cancelled => "cancelled",
            Error::Fatal(_) => "fatal runtime error",
            Error::Io(_) => "io error",
        }
    }

    fn cause(&self) -> Option<&error::Error> {
        match *self {
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Error::Reset,
            io::ErrorKind::UnexpectedEof => Error::Closed,
            _ => Error::Io(e),
        }
    }
}

impl From<ssl::Error> for Error {
    fn from(e: ssl::Error) -> Error {
        Error::Tls(e.to_string())
    }
}

impl From<ssl::HandshakeError<::mio::tcp::TcpStream>> for Error {
    fn from(e: ssl::HandshakeError<::mio::tcp::TcpStream>) -> Error {
        Error::Tls(e.to_string())
    }
}

impl From<::openssl::error::ErrorStack> for Error {
    fn from(e: ::openssl::error::ErrorStack) -> Error {
        Error::Tls(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = ::std::result::Result<T, Error>;

/// True if the raw `errno` value means "no data/space right now, retry
/// after the next readiness or timer event" rather than a hard failure.
#[inline]
pub fn is_transient(raw_errno: i32) -> bool {
    raw_errno == ::libc::EAGAIN || raw_errno == ::libc::EWOULDBLOCK || raw_errno == ::libc::EINTR
}
