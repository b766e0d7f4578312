// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Non-blocking I/O handle (C7): a TCP socket, optionally wrapped in TLS,
//! whose readiness is observed through two conditions instead of a
//! blocking syscall. Grounded on `machine_io_t`
//! (`examples/original_source/sources/io.h`): the handle itself only
//! remembers *which* condition is currently armed per direction (a
//! clone, never an owner) -- the framed stream (`stream.rs`) is the
//! canonical owner that creates and frees those conditions.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::tcp::{TcpListener, TcpStream};
use openssl::ssl::{
    Error as SslError, HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslStream,
};

use cond::Condition;
use error::{Error, Result};
use runtime::processor::Processor;

enum Transport {
    Plain(TcpStream),
    Handshaking(MidHandshakeSslStream<TcpStream>),
    Tls(SslStream<TcpStream>),
    /// Transient placeholder occupying `self.transport` only for the
    /// instant between a `mem::replace` out of it and the next assignment
    /// back into it, inside `set_tls`'s handshake loop. Never observed
    /// across a suspension point and never seen by a caller.
    Moved,
}

impl Transport {
    fn evented(&self) -> &TcpStream {
        match *self {
            Transport::Plain(ref s) => s,
            Transport::Handshaking(ref s) => s.get_ref(),
            Transport::Tls(ref s) => s.get_ref(),
            Transport::Moved => unreachable!("I/O performed on a handle mid-transport-swap"),
        }
    }
}

/// Reclassify a raw OS error that `io::Error`'s own `ErrorKind` doesn't
/// already tag as `WouldBlock` (some platforms surface `EINTR` as
/// `Interrupted` rather than folding it into the retry-now bucket) so the
/// read/write loops above only ever need to match one kind.
fn classify_io_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::WouldBlock {
        return Error::Io(e);
    }
    let transient = e
        .raw_os_error()
        .map(::error::is_transient)
        .unwrap_or(false);
    if transient {
        Error::Io(io::Error::new(io::ErrorKind::WouldBlock, e))
    } else {
        Error::from(e)
    }
}

/// A non-blocking socket, attached to the current worker's poller on
/// demand. Created detached; `attach` registers it, `detach` removes it,
/// `close` shuts the descriptor down. Owns its last error text so callers
/// that only want a message (rather than an `Error`) can still get one.
pub struct IoHandle {
    transport: Transport,
    token: Option<::mio::Token>,
    read_started: bool,
    last_error: Option<String>,
}

impl IoHandle {
    fn from_stream(stream: TcpStream) -> IoHandle {
        IoHandle {
            transport: Transport::Plain(stream),
            token: None,
            read_started: false,
            last_error: None,
        }
    }

    /// Initiate a non-blocking connect. The socket is immediately
    /// attached: callers observe completion as the first `on_write`
    /// readiness rather than a separate "connected" state.
    pub fn connect(addr: &SocketAddr) -> Result<IoHandle> {
        let stream = TcpStream::connect(addr)?;
        Ok(IoHandle::from_stream(stream))
    }

    pub fn attach(&mut self) -> Result<()> {
        if self.token.is_some() {
            return Ok(());
        }
        let token = Processor::register_io(self.transport.evented())?;
        self.token = Some(token);
        Ok(())
    }

    pub fn detach(&mut self) {
        if let Some(token) = self.token.take() {
            Processor::deregister_io(self.transport.evented(), token);
        }
    }

    pub fn close(&mut self) {
        self.detach();
    }

    pub fn error(&self) -> &str {
        self.last_error.as_ref().map(|s| s.as_str()).unwrap_or("")
    }

    /// Arm edge-triggered readability so the scheduler signals `cond`
    /// when new bytes arrive. Idempotent: once armed, stays armed for
    /// `cond`'s owner until `read_stop`.
    pub fn read_start(&mut self, cond: &Condition) {
        self.read_started = true;
        if let Some(token) = self.token {
            Processor::rearm_read(token, Some(cond.clone()));
        }
    }

    pub fn read_stop(&mut self) {
        self.read_started = false;
        if let Some(token) = self.token {
            Processor::rearm_read(token, None);
        }
    }

    pub fn is_read_started(&self) -> bool {
        self.read_started
    }

    fn rearm_write(&mut self, cond: Option<&Condition>) {
        if let Some(token) = self.token {
            Processor::rearm_write(token, cond.cloned());
        }
    }

    /// One syscall. `Ok(n)` for `n > 0` bytes read, `Ok(0)` for orderly
    /// EOF (the caller treats this as an error -- see `stream::read`),
    /// `Err(Error::Io(e))` with `e.kind() == WouldBlock` for
    /// `EAGAIN`/`EWOULDBLOCK`/`EINTR`, anything else a hard error.
    pub fn read_raw(&mut self, dst: &mut [u8]) -> Result<usize> {
        let result = match self.transport {
            Transport::Plain(ref mut s) => s.read(dst).map_err(classify_io_error),
            Transport::Tls(ref mut s) => match s.ssl_read(dst) {
                Ok(n) => Ok(n),
                Err(SslError::WantRead(_)) | Err(SslError::WantWrite(_)) => {
                    Err(Error::Io(io::Error::new(io::ErrorKind::WouldBlock, "tls")))
                }
                Err(e) => Err(Error::from(e)),
            },
            Transport::Handshaking(_) => {
                Err(Error::Fatal("read on a handle mid-TLS-handshake".into()))
            }
            Transport::Moved => Err(Error::Fatal("read on a handle mid-transport-swap".into())),
        };
        if let Err(ref e) = result {
            self.last_error = Some(e.to_string());
        }
        result
    }

    fn write_raw(&mut self, src: &[u8]) -> Result<usize> {
        let result = match self.transport {
            Transport::Plain(ref mut s) => s.write(src).map_err(classify_io_error),
            Transport::Tls(ref mut s) => match s.ssl_write(src) {
                Ok(n) => Ok(n),
                Err(SslError::WantRead(_)) | Err(SslError::WantWrite(_)) => {
                    Err(Error::Io(io::Error::new(io::ErrorKind::WouldBlock, "tls")))
                }
                Err(e) => Err(Error::from(e)),
            },
            Transport::Handshaking(_) => {
                Err(Error::Fatal("write on a handle mid-TLS-handshake".into()))
            }
            Transport::Moved => Err(Error::Fatal("write on a handle mid-transport-swap".into())),
        };
        if let Err(ref e) = result {
            self.last_error = Some(e.to_string());
        }
        result
    }

    /// Drain `msg` with a series of non-blocking writes, parking on
    /// `on_write` between partial writes, bounded by `timeout_ms`.
    pub fn write(&mut self, msg: &[u8], on_write: &Condition, timeout_ms: Option<u64>) -> Result<()> {
        let mut offset = 0;
        while offset < msg.len() {
            match self.write_raw(&msg[offset..]) {
                Ok(n) if n > 0 => offset += n,
                Ok(_) => return Err(Error::Closed),
                Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.rearm_write(Some(on_write));
                    on_write.wait(timeout_ms)?;
                }
                Err(e) => return Err(e),
            }
        }
        self.rearm_write(None);
        Ok(())
    }

    /// Replace the raw byte-plane with a TLS state machine, honoring
    /// `WANT_READ`/`WANT_WRITE` during the handshake by rearming whichever
    /// condition the SSL state asked for.
    pub fn set_tls(
        &mut self,
        ctx: &SslContext,
        server_side: bool,
        on_read: &Condition,
        on_write: &Condition,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        let stream = match ::std::mem::replace(&mut self.transport, Transport::Moved) {
            Transport::Plain(s) => s,
            other => {
                self.transport = other;
                return Err(Error::Fatal("set_tls called twice on the same handle".into()));
            }
        };

        let ssl = Ssl::new(ctx)?;
        let mut attempt = if server_side {
            SslStream::accept(ssl, stream)
        } else {
            SslStream::connect(ssl, stream)
        };

        loop {
            match attempt {
                Ok(established) => {
                    self.transport = Transport::Tls(established);
                    self.rearm_read(None);
                    self.rearm_write(None);
                    return Ok(());
                }
                Err(HandshakeError::Interrupted(mid)) => {
                    let wants_write = match *mid.error() {
                        SslError::WantWrite(_) => true,
                        _ => false,
                    };
                    self.transport = Transport::Handshaking(mid);
                    if wants_write {
                        self.rearm_write(Some(on_write));
                        on_write.wait(timeout_ms)?;
                    } else {
                        self.rearm_read(Some(on_read));
                        on_read.wait(timeout_ms)?;
                    }
                    attempt = match ::std::mem::replace(&mut self.transport, Transport::Moved) {
                        Transport::Handshaking(mid) => mid.handshake(),
                        _ => unreachable!("handle was mutated during its own handshake"),
                    };
                }
                Err(HandshakeError::Failure(mid)) => {
                    return Err(Error::Tls(mid.error().to_string()));
                }
                Err(HandshakeError::SetupFailure(e)) => {
                    return Err(Error::Tls(e.to_string()));
                }
            }
        }
    }

    fn rearm_read(&mut self, cond: Option<&Condition>) {
        if let Some(token) = self.token {
            Processor::rearm_read(token, cond.cloned());
        }
    }
}

/// A non-blocking listening socket (the `bind`/`accept` half of C7).
pub struct Listener {
    inner: TcpListener,
    token: Option<::mio::Token>,
}

impl Listener {
    pub fn bind(addr: &SocketAddr) -> Result<Listener> {
        let inner = TcpListener::bind(addr)?;
        Ok(Listener {
            inner: inner,
            token: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Error::from)
    }

    pub fn attach(&mut self) -> Result<()> {
        if self.token.is_some() {
            return Ok(());
        }
        let token = Processor::register_io(&self.inner)?;
        self.token = Some(token);
        Ok(())
    }

    pub fn detach(&mut self) {
        if let Some(token) = self.token.take() {
            Processor::deregister_io(&self.inner, token);
        }
    }

    /// Accept one connection, parking on `on_read` between poll cycles
    /// when none is queued yet.
    pub fn accept(&mut self, on_read: &Condition, timeout_ms: Option<u64>) -> Result<IoHandle> {
        loop {
            match self.inner.accept() {
                Ok(Some((stream, _addr))) => return Ok(IoHandle::from_stream(stream)),
                Ok(None) => {
                    if let Some(token) = self.token {
                        Processor::rearm_read(token, Some(on_read.clone()));
                    }
                    on_read.wait(timeout_ms)?;
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }
}
