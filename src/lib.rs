// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Cooperative coroutine I/O core for a PostgreSQL-family connection
//! pooler: worker threads, each driving one scheduler over stackful
//! coroutines, a timer wheel, one-shot condition variables, and a
//! readahead-buffered stream speaking protocol v3 framing.
//!
//! Lineage: a non-work-stealing, pinned-coroutine scheduler grounded on
//! the `coio-rs` family (see `DESIGN.md` for the per-module grounding
//! ledger). The pool/auth/proxy layers that route connections and speak
//! SQL semantics sit above this crate; this crate only owns scheduling
//! and the byte-level wire framing they run on top of.

extern crate context;
extern crate libc;
extern crate mio;
extern crate num_cpus;
extern crate openssl;
extern crate slab;

#[macro_use]
extern crate log;

pub mod clock;
pub mod cond;
pub mod coroutine;
pub mod error;
pub mod io_handle;
pub mod join_handle;
pub mod options;
pub mod protocol;
pub mod readahead;
pub mod runtime;
pub mod scheduler;
pub mod stream;
pub mod sync;

pub use cond::Condition;
pub use coroutine::CoroutineId;
pub use error::{Error, Result};
pub use io_handle::{IoHandle, Listener};
pub use join_handle::JoinHandle;
pub use options::{Options, RuntimeOptions};
pub use protocol::MessageBuffer;
pub use runtime::{Worker, WorkerId};
pub use scheduler::{cancel, cancel_remote, sleep, spawn, spawn_opts, yield_now, Runtime};
pub use stream::FramedStream;
