// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Framed, readahead-buffered stream (C8), the `io_facade` layer between
//! a raw `IoHandle` and the protocol framer. Grounded on `od_io_t`
//! (`examples/original_source/sources/io.h`): pairs one readahead buffer
//! with the two conditions a handle's poller registration needs, and
//! exposes `read(dst, timeout_ms)` as "exactly `dst.len()` bytes or an
//! error" rather than a partial-read API, since the protocol framer
//! above it only ever wants whole headers or whole payloads.

use std::time::{Duration, Instant};

use cond::Condition;
use error::{Error, Result};
use io_handle::IoHandle;
use options::DEFAULT_READAHEAD_CAP;
use readahead::Readahead;
use runtime::processor::Processor;

/// A connection's read/write front, owning both halves of the
/// round-trip: the socket (`IoHandle`) and the readahead buffer batching
/// its reads. Not `Clone` or `Send` across workers -- a framed stream
/// lives and dies on the worker that created its conditions.
pub struct FramedStream {
    handle: IoHandle,
    readahead: Readahead,
    on_read: Condition,
    on_write: Condition,
    read_started: bool,
}

impl FramedStream {
    /// Take ownership of an attached handle and give it a readahead
    /// buffer plus the conditions its poller registration will signal.
    /// Must run on the worker that will use the stream -- `Condition`s
    /// are bound to the worker creating them.
    pub fn prepare(handle: IoHandle, cap: usize) -> FramedStream {
        let owner = Processor::current_worker_id()
            .expect("FramedStream::prepare called without a running worker");
        let sender = Processor::current_sender();
        FramedStream {
            handle: handle,
            readahead: Readahead::new(cap),
            on_read: Condition::create(owner, sender.clone()),
            on_write: Condition::create(owner, sender),
            read_started: false,
        }
    }

    pub fn prepare_default(handle: IoHandle) -> FramedStream {
        FramedStream::prepare(handle, DEFAULT_READAHEAD_CAP)
    }

    /// Give back the underlying handle, stopping readahead first if it
    /// was left armed. The stream's conditions are dropped with it.
    pub fn free(mut self) -> IoHandle {
        if self.read_started {
            self.handle.read_stop();
        }
        self.handle
    }

    pub fn handle(&self) -> &IoHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut IoHandle {
        &mut self.handle
    }

    /// Fill `dst` with exactly `dst.len()` bytes, or fail. `timeout_ms`
    /// bounds the whole call, not any one wait inside it.
    pub fn read(&mut self, dst: &mut [u8], timeout_ms: Option<u64>) -> Result<()> {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut filled = 0;
        let mut signalled_once = false;

        let result = loop {
            if self.readahead.unread() > 0 {
                filled += self.readahead.copy_out(&mut dst[filled..]);
                if filled == dst.len() {
                    break Ok(());
                }
                continue;
            }
            self.readahead.reuse();

            if !signalled_once {
                // Cover the race where bytes already arrived between an
                // earlier armed read_start and this call.
                self.on_read.signal();
                signalled_once = true;
            }

            match remaining_ms(deadline) {
                Some(0) => break Err(Error::Timeout),
                remaining => {
                    if let Err(e) = self.on_read.wait(remaining) {
                        break Err(e);
                    }
                }
            }

            match self.handle.read_raw(self.readahead.tail_slice_mut()) {
                Ok(n) if n > 0 => {
                    self.readahead.advance_write(n);
                }
                Ok(_) => break Err(Error::Closed),
                Err(Error::Io(ref e)) if e.kind() == ::std::io::ErrorKind::WouldBlock => {
                    if !self.read_started {
                        self.handle.read_start(&self.on_read);
                        self.read_started = true;
                    }
                }
                Err(e) => break Err(e),
            }
        };

        if self.read_started {
            self.handle.read_stop();
            self.read_started = false;
        }

        result
    }

    pub fn write(&mut self, msg: &[u8], timeout_ms: Option<u64>) -> Result<()> {
        self.handle.write(msg, &self.on_write, timeout_ms)
    }
}

/// Milliseconds left until `deadline`, or `None` for no deadline. `Some(0)`
/// means the deadline has already passed.
fn remaining_ms(deadline: Option<Instant>) -> Option<u64> {
    deadline.map(|d| {
        let now = Instant::now();
        if now >= d {
            0
        } else {
            let left = d - now;
            left.as_secs() * 1000 + (left.subsec_nanos() / 1_000_000) as u64
        }
    })
}
