// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Crate-level façade used by the code embedding this runtime (the pool
//! and proxy layers the I/O core sits under): runtime/worker lifecycle,
//! and the coroutine operations (`spawn`, `yield_now`, `sleep`, `cancel`,
//! `JoinHandle::join`) available to code running on a worker. Grounded
//! on the coio-rs lineage's free-function `Scheduler::spawn` /
//! `Scheduler::sched` style (`examples/other_examples/.../scheduler.rs`),
//! collapsed here onto this crate's single-owner-per-worker `Processor`
//! instead of that lineage's work-stealing one.

use std::panic;
use std::thread;

use coroutine::{self, CoroutineId, Resumption};
use error::{Error, Result};
use join_handle::{self, JoinHandle};
use mio;
use options::{Options, RuntimeOptions};
use runtime::processor::Processor;
use runtime::{self, Message, Worker, WorkerId};

/// Host-owned handle to a set of workers spawned under one configuration.
/// Dropping it without calling `free` leaks nothing -- workers run to
/// completion independently -- but leaves them unjoined.
pub struct Runtime {
    opts: RuntimeOptions,
    workers: Vec<Worker>,
}

impl Runtime {
    /// Install the crate's panic hook (tags panics with the coroutine
    /// they happened in) and record the configuration new workers and
    /// framed streams should default to.
    pub fn init(opts: RuntimeOptions) -> Runtime {
        runtime::install_panic_hook();
        Runtime {
            opts: opts,
            workers: Vec::new(),
        }
    }

    pub fn readahead_cap(&self) -> usize {
        self.opts.readahead_cap
    }

    pub fn worker_count(&self) -> usize {
        self.opts.workers
    }

    /// Spawn a worker thread running `entry` as its root coroutine.
    pub fn spawn_worker<F>(&mut self, name: &str, entry: F) -> WorkerId
    where
        F: FnOnce() + Send + 'static,
    {
        let worker = runtime::worker_spawn(name, entry);
        let id = worker.id();
        self.workers.push(worker);
        id
    }

    /// Block until the named worker's loop has drained and exited,
    /// returning its root coroutine's exit code. `None` if no worker
    /// with that id is tracked by this `Runtime` (already waited on, or
    /// never spawned through it).
    pub fn wait_worker(&mut self, id: WorkerId) -> Option<i32> {
        let pos = self.workers.iter().position(|w| w.id() == id)?;
        Some(self.workers.remove(pos).join())
    }

    /// Block until every still-tracked worker has drained and exited.
    pub fn free(mut self) {
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

/// Spawn a coroutine on the current worker with default options,
/// returning a handle to its eventual result.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_opts(f, Options::default())
}

/// As `spawn`, with explicit stack size / naming.
pub fn spawn_opts<F, T>(f: F, opts: Options) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = join_handle::handle_pair();
    let wrapper = move || {
        let result = panic::catch_unwind(panic::AssertUnwindSafe(f));
        tx.send(result);
    };
    Processor::spawn_current(wrapper, opts);
    rx
}

/// Give the scheduler's dispatch loop a chance to run other runnable
/// coroutines before this one continues. A no-op off a worker thread.
pub fn yield_now() {
    if let Some(id) = Processor::current_id() {
        Processor::make_ready_current(id, Resumption::Ok);
        coroutine::suspend();
    }
}

/// Park the current coroutine for at least `ms` milliseconds.
pub fn sleep(ms: u64) -> Result<()> {
    let id =
        Processor::current_id().expect("scheduler::sleep called without a running coroutine");
    Processor::mark_current_parked();
    let timer = Processor::clock_add(ms, id);
    let outcome = coroutine::suspend();
    match outcome {
        Resumption::TimedOut => Ok(()),
        Resumption::Ok => {
            if let Some(t) = timer {
                Processor::clock_del(t);
            }
            Ok(())
        }
        Resumption::Cancelled => {
            if let Some(t) = timer {
                Processor::clock_del(t);
            }
            Err(Error::Cancelled)
        }
    }
}

/// Request cancellation of a coroutine owned by the current worker.
/// Cancellation is cooperative: a running coroutine only observes it at
/// its next suspension point (a condition wait, a sleep, a framed read).
pub fn cancel(id: CoroutineId) {
    Processor::request_cancel_current(id);
}

/// Request cancellation of a coroutine owned by a different worker,
/// reached through that worker's inbox (e.g. `Worker::sender()`).
pub fn cancel_remote(sender: &mio::Sender<Message>, id: CoroutineId) {
    let _ = sender.send(Message::Cancel(id));
}
