// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The host-facing runtime lifecycle (C6): worker threads, each hosting
//! exactly one scheduler, created and joined by whoever embeds this
//! crate (the pool/proxy layers this core sits under). Workers are
//! independent -- a fault in one does not affect the others -- and
//! coroutines are pinned to the worker that created them for their whole
//! lifetime; there is no work stealing.

pub mod processor;

use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use mio;

use coroutine::CoroutineId;
use options::Options;
use runtime::processor::Processor;

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(1);

/// Opaque, process-unique worker identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(usize);

impl WorkerId {
    /// Mint a new process-unique worker id. `pub` because it is the only
    /// way to stand up a bare `Processor` for a test -- every in-crate
    /// `#[cfg(test)]` module and the `tests/` integration suite call this
    /// directly rather than going through `Runtime::spawn_worker`.
    pub fn next() -> WorkerId {
        WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/// Messages a worker's scheduler accepts from other threads (other
/// workers, or the host). This -- plus the worker-join handshake -- is
/// the *only* shared mutable state that crosses worker boundaries.
pub enum Message {
    /// Wake a specific parked coroutine on this worker with an ordinary
    /// (non-timeout, non-cancelled) reason.
    Ready(CoroutineId),
    /// Deliver a cancellation to a specific coroutine owned by this
    /// worker.
    Cancel(CoroutineId),
    /// Stop accepting new work and unwind once the run queue drains.
    Shutdown,
}

unsafe impl Send for Message {}

/// A running worker: its OS thread and a cheap, cloneable handle to its
/// scheduler's inbox, used for cross-worker signalling.
pub struct Worker {
    id: WorkerId,
    thread: Option<thread::JoinHandle<i32>>,
    sender: mio::Sender<Message>,
}

impl Worker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// A cloneable handle other workers (or conditions owned by this
    /// worker) use to reach this worker's inbox.
    pub fn sender(&self) -> mio::Sender<Message> {
        self.sender.clone()
    }

    /// Block the calling (host) thread until this worker's scheduler
    /// loop has drained and exited, returning the root coroutine's exit
    /// code.
    pub fn join(mut self) -> i32 {
        self.thread
            .take()
            .expect("worker already joined")
            .join()
            .unwrap_or(-1)
    }
}

/// Spawn an OS thread that builds a scheduler, runs `entry` as its root
/// coroutine, drains the run queue, then exits. Mirrors
/// `worker_spawn(name, entry, arg)` from the external interface.
pub fn worker_spawn<F>(name: &str, entry: F) -> Worker
where
    F: FnOnce() + Send + 'static,
{
    let id = WorkerId::next();
    let name_owned = name.to_owned();
    // The worker's `mio::Sender` only exists once its `EventLoop` has
    // been constructed on its own thread; hand it back to the spawner
    // over a plain oneshot rather than pre-building it out here.
    let (handle_tx, handle_rx) = mpsc::channel::<mio::Sender<Message>>();

    let thread = thread::Builder::new()
        .name(name_owned.clone())
        .spawn(move || {
            let (mut processor, event_loop) = Processor::new(id, name_owned);
            handle_tx
                .send(event_loop.channel())
                .expect("spawner dropped its end of the handoff channel");
            let mut root_opts = Options::new();
            root_opts.name(String::from("<root>"));
            processor.run_to_completion(event_loop, entry, root_opts)
        })
        .expect("failed to spawn worker thread");

    let sender = handle_rx
        .recv()
        .expect("worker thread exited before publishing its sender");

    Worker {
        id,
        thread: Some(thread),
        sender,
    }
}

/// Install a panic hook once per process that tags panic messages with
/// the coroutine and worker they happened in, matching `Scheduler::run`'s
/// behaviour in the coio-rs lineage (`examples/other_examples/.../scheduler.rs`).
pub fn install_panic_hook() {
    use std::sync::Once;
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(name) = Processor::current_coroutine_name() {
                eprintln!("coroutine `{}` panicked", name);
            }
            default_hook(info);
        }));
    });
}
