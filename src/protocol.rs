// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! PostgreSQL wire protocol v3 framing (C9).
//!
//! Two entry points on a framed stream: the one-off startup packet (no
//! type byte, just a length-prefixed blob) and every ordinary message
//! after it (`{type:u8, length:u32_be}` header, then `length - 4` more
//! bytes of payload). Grounded on the header-then-payload framing in
//! `examples/original_source/sources/io.c`'s message reader and the
//! `30000`-byte heuristic it uses to reject non-protocol traffic before
//! committing to a large allocation.

use error::{Error, Result};
use stream::FramedStream;

/// Smallest length a v3 header can declare; the 4 length bytes
/// themselves are always included in `length`.
const MIN_MESSAGE_LENGTH: u32 = 4;

/// Above this, a message is only accepted if its type tag is one of
/// `VALID_LONG_MESSAGE_TYPES` -- the same heuristic libpq uses to catch
/// a peer that isn't actually speaking the protocol before allocating a
/// buffer sized off of attacker- or garbage-controlled bytes.
const MAX_ORDINARY_MESSAGE_LENGTH: u32 = 30000;

/// Message kinds legitimately allowed past `MAX_ORDINARY_MESSAGE_LENGTH`:
/// row description, data row, copy data, function-call response, error,
/// notice, notification, bind, parse, simple query.
const VALID_LONG_MESSAGE_TYPES: &[u8] = b"TDdVENABPQ";

/// An owned, framed protocol message: the raw bytes including whatever
/// header preceded the payload (4 bytes for a startup packet, 5 for an
/// ordinary message). `tag` is `None` for a startup packet, which has no
/// type byte.
pub struct MessageBuffer {
    bytes: Vec<u8>,
    tag: Option<u8>,
}

impl MessageBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn message_type(&self) -> Option<u8> {
        self.tag
    }

    /// Bytes after the header: `length - 4` of them either way.
    pub fn payload(&self) -> &[u8] {
        let header_len = if self.tag.is_some() { 5 } else { 4 };
        &self.bytes[header_len..]
    }
}

fn is_valid_long_message_type(tag: u8) -> bool {
    VALID_LONG_MESSAGE_TYPES.contains(&tag)
}

/// Read a startup packet: a 4-byte big-endian length `L` followed by
/// `L - 4` more bytes. Used once, at connection setup, before the
/// ordinary-message type byte comes into play.
pub fn read_startup(stream: &mut FramedStream, timeout_ms: Option<u64>) -> Result<MessageBuffer> {
    let mut header = [0u8; 4];
    stream.read(&mut header, timeout_ms)?;
    let length = be_u32(&header);

    if length < MIN_MESSAGE_LENGTH {
        return Err(Error::Protocol(format!(
            "startup packet length {} below the 4-byte header size",
            length
        )));
    }

    let mut buf = vec![0u8; length as usize];
    buf[..4].copy_from_slice(&header);
    stream.read(&mut buf[4..], timeout_ms)?;

    Ok(MessageBuffer {
        bytes: buf,
        tag: None,
    })
}

/// Read one ordinary message: a 5-byte `{type, length}` header, then
/// `length - 4` bytes of payload. Rejects headers that don't look like
/// v3 traffic rather than committing to the allocation they'd imply.
pub fn read(stream: &mut FramedStream, timeout_ms: Option<u64>) -> Result<MessageBuffer> {
    let mut header = [0u8; 5];
    stream.read(&mut header, timeout_ms)?;

    let tag = header[0];
    let length = be_u32(&header[1..5]);

    if length < MIN_MESSAGE_LENGTH {
        return Err(Error::Protocol(format!(
            "message `{}` declares length {} below the 4-byte header size",
            tag as char, length
        )));
    }
    if tag < 0x20 {
        return Err(Error::Protocol(format!(
            "message tag {:#x} is a control byte, not a valid v3 message type",
            tag
        )));
    }
    if length > MAX_ORDINARY_MESSAGE_LENGTH && !is_valid_long_message_type(tag) {
        return Err(Error::Protocol(format!(
            "message `{}` declares length {}, over the {}-byte bound for its type",
            tag as char, length, MAX_ORDINARY_MESSAGE_LENGTH
        )));
    }

    let total = 5 + (length as usize - 4);
    let mut buf = vec![0u8; total];
    buf[..5].copy_from_slice(&header);
    stream.read(&mut buf[5..], timeout_ms)?;

    Ok(MessageBuffer {
        bytes: buf,
        tag: Some(tag),
    })
}

fn be_u32(b: &[u8]) -> u32 {
    ((b[0] as u32) << 24) | ((b[1] as u32) << 16) | ((b[2] as u32) << 8) | (b[3] as u32)
}

#[cfg(test)]
mod test {
    use super::*;
    use cond::Condition;
    use io_handle::{IoHandle, Listener};
    use options::Options;
    use runtime::processor::Processor;
    use runtime::WorkerId;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use stream::FramedStream;

    fn run<F: FnOnce() + Send + 'static>(entry: F) {
        let (mut processor, event_loop) = Processor::new(WorkerId::next(), "test".into());
        processor.run_to_completion(event_loop, entry, Options::default());
    }

    /// Spin up a listener/client pair on the current worker: the server
    /// side reads one ordinary message with `read` and records whether it
    /// came back as the protocol error the caller expects, while the
    /// client writes `wire_bytes` raw and disconnects.
    fn assert_read_rejects(wire_bytes: &'static [u8]) {
        let ok = Arc::new(AtomicBool::new(false));
        let ok2 = ok.clone();

        run(move || {
            let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
            let mut listener = Listener::bind(&addr).expect("bind");
            listener.attach().expect("attach listener");
            let server_addr = listener.local_addr().expect("local_addr");

            Processor::spawn_current(
                move || {
                    let on_accept = Condition::create(
                        Processor::current_worker_id().unwrap(),
                        Processor::current_sender(),
                    );
                    let mut server_handle =
                        listener.accept(&on_accept, Some(1_000)).expect("accept");
                    server_handle.attach().expect("attach accepted socket");
                    let mut stream = FramedStream::prepare_default(server_handle);
                    let rejected = match read(&mut stream, Some(1_000)) {
                        Err(Error::Protocol(_)) => true,
                        _ => false,
                    };
                    ok2.store(rejected, Ordering::SeqCst);
                },
                Options::default(),
            );

            Processor::spawn_current(
                move || {
                    let mut client = IoHandle::connect(&server_addr).expect("connect");
                    client.attach().expect("attach client socket");
                    let mut stream = FramedStream::prepare_default(client);
                    stream.write(wire_bytes, Some(1_000)).expect("write");
                    stream.free();
                },
                Options::default(),
            );
        });

        assert!(ok.load(Ordering::SeqCst));
    }

    #[test]
    fn rejects_headers_below_the_minimum_length() {
        assert_read_rejects(&[b'Q', 0, 0, 0, 3]);
    }

    #[test]
    fn control_byte_tags_are_rejected() {
        assert_read_rejects(&[0x1f, 0, 0, 0, 8, 1, 2, 3]);
    }

    #[test]
    fn long_message_allowlist_matches_the_long_message_types() {
        for &tag in b"TDdVENABPQ" {
            assert!(is_valid_long_message_type(tag));
        }
        assert!(!is_valid_long_message_type(b'X'));
        assert!(!is_valid_long_message_type(b'C'));
    }

    #[test]
    fn be_u32_decodes_big_endian() {
        assert_eq!(be_u32(&[0x00, 0x00, 0x01, 0x00]), 256);
        assert_eq!(be_u32(&[0x00, 0x01, 0x00, 0x00]), 65536);
    }
}
