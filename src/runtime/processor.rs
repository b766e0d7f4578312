// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-worker scheduler / event loop (C5).
//!
//! One `Processor` lives on each worker thread for the worker's whole
//! lifetime (`run_to_completion` never returns until its run queue and
//! coroutine table are both empty). It owns every coroutine it has
//! spawned, the worker's timer wheel, and the token table the poller uses
//! to route readiness back to whichever condition asked for it. None of
//! that crosses a thread boundary except through `Message` -- mirroring
//! the `Scheduler`/`Processor` split this lineage uses, but collapsed onto
//! a single non-work-stealing owner per worker (coroutines here are
//! pinned, never stolen, so there is no separate stealer/neighbor set to
//! maintain).
//!
//! `CURRENT` is the same trick as the lineage's `PROCESSOR` thread-local:
//! a raw pointer back to the `Processor` driving this worker, reachable
//! from deep inside a parked coroutine's own stack (e.g. `Condition::wait`
//! three frames down in a protocol parser) without threading it through
//! every call. `resume()` takes coroutines out of `coroutines` before
//! switching into them and puts them back after, so reentrant access to
//! `Processor` from the coroutine's own stack -- the normal case, since
//! registering a wait is exactly that -- never aliases a live borrow into
//! the table it's also trying to touch.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::ptr;

use mio::{self, EventLoop, EventSet, Handler, PollOpt, Token};
use slab::Slab;

use clock::{Clock, TimerId};
use cond::Condition;
use coroutine::{Coroutine, CoroutineId, Resumption};
use options::Options;
use runtime::{Message, WorkerId};

thread_local!(static CURRENT: Cell<*mut Processor> = Cell::new(ptr::null_mut()));
// `register_io`/`deregister_io` need `&mut EventLoop`, which `run_to_completion`
// only ever holds as a local (see the struct doc comment for why it isn't a
// field). Coroutines calling in from deep user code reach it through this
// thread-local the same way they reach the processor itself through `CURRENT`.
thread_local!(static CURRENT_EVENT_LOOP: Cell<*mut EventLoop<Processor>> = Cell::new(ptr::null_mut()));

/// Registered interest for one I/O handle's token: which condition (if
/// any) the poller should signal when that half becomes ready. A handle
/// keeps its token for as long as it is attached, rearming these as it
/// calls `read_start`/`read_stop`/`write`.
#[derive(Default)]
pub struct IoInterest {
    pub on_read: Option<Condition>,
    pub on_write: Option<Condition>,
}

/// Per-worker scheduler. Single-threaded: every method here runs on its
/// own worker thread, either from the dispatch loop directly or, via
/// `Processor::with_current`, from a suspended coroutine's own stack.
pub struct Processor {
    id: WorkerId,
    name: String,
    sender: mio::Sender<Message>,
    coroutines: HashMap<CoroutineId, Coroutine>,
    runnable: VecDeque<(CoroutineId, Resumption)>,
    current: Option<CoroutineId>,
    clock: Clock,
    io: Slab<IoInterest, usize>,
    shutdown: bool,
}

impl Processor {
    /// Build a processor and the `EventLoop` it will drive. Returned
    /// separately, not stored as a field: `EventLoop::run_once` takes its
    /// handler by `&mut`, and the handler *is* this processor, so the
    /// loop can't also live behind `&mut self` without aliasing it.
    pub fn new(id: WorkerId, name: String) -> (Processor, EventLoop<Processor>) {
        let event_loop = EventLoop::new().expect("failed to create worker event loop");
        let sender = event_loop.channel();
        let processor = Processor {
            id: id,
            name: name,
            sender: sender,
            coroutines: HashMap::new(),
            runnable: VecDeque::new(),
            current: None,
            clock: Clock::new(),
            io: Slab::new(256),
            shutdown: false,
        };
        (processor, event_loop)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn sender(&self) -> mio::Sender<Message> {
        self.sender.clone()
    }

    fn with_current<R, F: FnOnce(&mut Processor) -> R>(f: F) -> Option<R> {
        CURRENT.with(|cell| {
            let ptr = cell.get();
            if ptr.is_null() {
                None
            } else {
                Some(f(unsafe { &mut *ptr }))
            }
        })
    }

    /// Name of whichever coroutine is running on this worker right now,
    /// used by the crate's panic hook. `None` off a worker thread.
    pub fn current_coroutine_name() -> Option<String> {
        Processor::with_current(|p| {
            p.current
                .and_then(|id| p.coroutines.get(&id))
                .and_then(|c| c.name().map(|s| s.to_owned()))
        }).and_then(|x| x)
    }

    pub fn current_id() -> Option<CoroutineId> {
        Processor::with_current(|p| p.current).and_then(|x| x)
    }

    /// Id of the worker driving the processor running on this thread.
    pub fn current_worker_id() -> Option<WorkerId> {
        Processor::with_current(|p| p.id)
    }

    /// A cloneable handle to this worker's inbox, for conditions created
    /// on it to hand to cross-worker signallers.
    pub fn current_sender() -> mio::Sender<Message> {
        Processor::with_current(|p| p.sender.clone())
            .expect("Processor::current_sender called without a running worker")
    }

    /// Spawn a coroutine on the processor running on this thread. Panics
    /// off a worker thread -- mirrors `Scheduler::spawn`'s
    /// `expect("Processor required for spawn")` in the lineage.
    pub fn spawn_current<F>(f: F, opts: Options) -> CoroutineId
    where
        F: FnOnce() + Send + 'static,
    {
        Processor::with_current(|p| p.spawn(f, opts))
            .expect("coroutine_spawn called without a running worker")
    }

    pub fn spawn<F>(&mut self, f: F, opts: Options) -> CoroutineId
    where
        F: FnOnce() + Send + 'static,
    {
        let coro = Coroutine::spawn(f, opts);
        let id = coro.id();
        self.coroutines.insert(id, coro);
        self.runnable.push_back((id, Resumption::Ok));
        id
    }

    /// Push a coroutine owned by this processor back onto the run queue,
    /// whether or not it's currently parked. A no-op if it already
    /// finished or belongs to a different worker. `self.current == Some(id)`
    /// covers a coroutine yielding to itself: `resume` holds it out of
    /// `coroutines` for the duration of the switch, so a plain
    /// `contains_key` would miss it and drop the wakeup.
    pub fn make_ready(&mut self, id: CoroutineId, reason: Resumption) {
        if self.coroutines.contains_key(&id) || self.current == Some(id) {
            self.runnable.push_back((id, reason));
        }
    }

    /// Current-worker equivalent of `make_ready`, for callers (like
    /// `Condition::signal`) that only have `Processor::with_current`.
    pub fn make_ready_current(id: CoroutineId, reason: Resumption) {
        Processor::with_current(|p| p.make_ready(id, reason));
    }

    /// Mark the coroutine running on this thread as parked. Must be
    /// called from that coroutine's own stack, before `coroutine::suspend`.
    pub fn mark_current_parked() {
        Processor::with_current(|p| {
            if let Some(id) = p.current {
                if let Some(coro) = p.coroutines.get_mut(&id) {
                    coro.mark_parked();
                }
            }
        });
    }

    pub fn request_cancel(&mut self, id: CoroutineId) {
        if let Some(coro) = self.coroutines.get(&id) {
            coro.request_cancel();
            self.runnable.push_back((id, Resumption::Cancelled));
        }
    }

    /// Current-worker equivalent of `request_cancel`, for cancelling a
    /// sibling coroutine on the same worker without a `&mut Processor`.
    pub fn request_cancel_current(id: CoroutineId) {
        Processor::with_current(|p| p.request_cancel(id));
    }

    pub fn clock_add(timeout_ms: u64, waiter: CoroutineId) -> Option<TimerId> {
        Processor::with_current(|p| {
            p.clock.refresh_now();
            let deadline = p.clock.now_ms() + timeout_ms;
            p.clock.add(deadline, waiter)
        })
    }

    pub fn clock_del(timer: TimerId) {
        Processor::with_current(|p| p.clock.del(timer));
    }

    /// Run `f` with a raw pointer to the current worker's `EventLoop`,
    /// for code that can't receive it as an ordinary argument (a
    /// coroutine registering or dropping an I/O handle). `None` off a
    /// worker thread or between `run_to_completion` calls.
    fn with_current_event_loop<R, F: FnOnce(&mut EventLoop<Processor>) -> R>(f: F) -> Option<R> {
        CURRENT_EVENT_LOOP.with(|cell| {
            let ptr = cell.get();
            if ptr.is_null() {
                None
            } else {
                Some(f(unsafe { &mut *ptr }))
            }
        })
    }

    /// Register an edge-triggered I/O source with the worker's poller and
    /// return the token it's known by from here on. This, `rearm_read`,
    /// `rearm_write` and `deregister_io` are the only points where
    /// `io_handle` touches the processor directly.
    pub fn register_io<E: mio::Evented>(source: &E) -> io::Result<Token> {
        let mut result = Err(io::Error::new(io::ErrorKind::Other, "no running worker"));
        Processor::with_current_event_loop(|event_loop| {
            Processor::with_current(|p| {
                if p.io.remaining() == 0 {
                    let grow = p.io.count().max(64);
                    p.io.grow(grow);
                }
                p.io.insert_with_opt(|idx| {
                    let token = Token(idx);
                    match event_loop.register(
                        source,
                        token,
                        EventSet::readable() | EventSet::writable() | EventSet::hup(),
                        PollOpt::edge(),
                    ) {
                        Ok(()) => {
                            result = Ok(token);
                            Some(IoInterest::default())
                        }
                        Err(e) => {
                            result = Err(e);
                            None
                        }
                    }
                });
            });
        });
        result
    }

    pub fn rearm_read(token: Token, cond: Option<Condition>) {
        Processor::with_current(|p| {
            if let Some(interest) = p.io.get_mut(token.as_usize()) {
                interest.on_read = cond;
            }
        });
    }

    pub fn rearm_write(token: Token, cond: Option<Condition>) {
        Processor::with_current(|p| {
            if let Some(interest) = p.io.get_mut(token.as_usize()) {
                interest.on_write = cond;
            }
        });
    }

    pub fn deregister_io<E: mio::Evented>(source: &E, token: Token) {
        Processor::with_current(|p| {
            let _ = p.io.remove(token.as_usize());
        });
        Processor::with_current_event_loop(|event_loop| {
            let _ = event_loop.deregister(source);
        });
    }

    /// Resume one coroutine until it next suspends or finishes. The
    /// coroutine is removed from `coroutines` for the duration of the
    /// switch so reentrant access from its own stack -- registering a
    /// condition wait, spawning a sibling -- sees a table it can freely
    /// mutate instead of one already borrowed by this call frame.
    fn resume(&mut self, id: CoroutineId, reason: Resumption) {
        let mut coro = match self.coroutines.remove(&id) {
            Some(c) => c,
            None => return,
        };
        if coro.is_finished() {
            return;
        }
        trace!(
            "worker `{}`: resuming coroutine `{}`",
            self.name,
            coro.name().unwrap_or("<unnamed>")
        );
        self.current = Some(id);
        coro.resume(reason);
        self.current = None;
        if !coro.is_finished() {
            self.coroutines.insert(id, coro);
        }
    }

    /// Step 1 of the dispatch loop: drain the run queue.
    fn dispatch_runnable(&mut self) {
        while let Some((id, reason)) = self.runnable.pop_front() {
            self.resume(id, reason);
        }
    }

    /// Step 5: pop every expired timer and push its waiter back onto the
    /// run queue with a timeout reason.
    fn dispatch_expired_timers(&mut self) {
        for expired in self.clock.step() {
            self.runnable
                .push_back((expired.waiter, Resumption::TimedOut));
        }
    }

    fn is_drained(&self) -> bool {
        self.coroutines.is_empty() && self.runnable.is_empty()
    }

    /// Run the worker's whole lifetime: spawn `entry` as the root
    /// coroutine, then loop dispatch -> deadline compute -> poll -> fire
    /// timers (spec steps 1-5) until nothing is left to run (step 6).
    pub fn run_to_completion<F>(
        &mut self,
        mut event_loop: EventLoop<Processor>,
        entry: F,
        opts: Options,
    ) -> i32
    where
        F: FnOnce() + Send + 'static,
    {
        CURRENT.with(|cell| cell.set(self as *mut Processor));
        CURRENT_EVENT_LOOP.with(|cell| cell.set(&mut event_loop as *mut EventLoop<Processor>));

        self.spawn(entry, opts);

        while !self.is_drained() && !self.shutdown {
            self.dispatch_runnable();

            if self.is_drained() || self.shutdown {
                break;
            }

            self.clock.refresh_now();
            let timeout_ms = self.clock.min_deadline_ms().map(|deadline| {
                let now = self.clock.now_ms();
                if deadline > now {
                    deadline - now
                } else {
                    0
                }
            });

            if let Err(e) = event_loop.run_once(self, timeout_ms.map(|ms| ms as usize)) {
                error!("worker `{}`: poller failed: {}", self.name, e);
                break;
            }

            self.dispatch_expired_timers();
        }

        CURRENT_EVENT_LOOP.with(|cell| cell.set(ptr::null_mut()));
        CURRENT.with(|cell| cell.set(ptr::null_mut()));
        0
    }
}

impl Handler for Processor {
    type Timeout = ();
    type Message = Message;

    fn ready(&mut self, _event_loop: &mut EventLoop<Processor>, token: Token, events: EventSet) {
        let (readable, writable) = (
            events.is_readable() || events.is_hup() || events.is_error(),
            events.is_writable() || events.is_error(),
        );
        // `clone`, not `take`: a condition stays armed across however many
        // edge-triggered readiness events it takes to drain a handle --
        // `read_start`/a pending write are idempotent and remain armed
        // until the caller explicitly disarms them (`read_stop`, a
        // completed `write`, or `deregister_io`). Clearing it here on the
        // first fire would strand a multi-chunk read: the second and
        // later partial reads would have no condition left to wake them.
        let (on_read, on_write) = match self.io.get(token.as_usize()) {
            Some(interest) => (
                if readable { interest.on_read.clone() } else { None },
                if writable { interest.on_write.clone() } else { None },
            ),
            None => (None, None),
        };
        if let Some(cond) = on_read {
            cond.signal();
        }
        if let Some(cond) = on_write {
            cond.signal();
        }
    }

    fn notify(&mut self, _event_loop: &mut EventLoop<Processor>, msg: Message) {
        match msg {
            Message::Ready(id) => self.make_ready(id, Resumption::Ok),
            Message::Cancel(id) => self.request_cancel(id),
            Message::Shutdown => self.shutdown = true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use runtime::WorkerId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn run<F: FnOnce() + Send + 'static>(entry: F) -> i32 {
        let (mut processor, event_loop) = Processor::new(WorkerId::next(), "test".into());
        processor.run_to_completion(event_loop, entry, Options::default())
    }

    #[test]
    fn dispatch_runs_spawned_children_to_completion() {
        // The root coroutine spawns two children and returns without
        // waiting on them; the dispatcher must keep draining `runnable`
        // past the root's own exit until both have also finished.
        let ran = Arc::new(AtomicUsize::new(0));
        let a = ran.clone();
        let b = ran.clone();
        run(move || {
            Processor::spawn_current(
                move || {
                    a.fetch_add(1, Ordering::SeqCst);
                },
                Options::default(),
            );
            Processor::spawn_current(
                move || {
                    b.fetch_add(1, Ordering::SeqCst);
                },
                Options::default(),
            );
        });
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
