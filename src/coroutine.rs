// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Stackful user-space coroutines (C4).
//!
//! Each coroutine owns a dedicated, fixed-size stack and a saved CPU
//! context; a context switch just swaps the stack pointer and restores
//! callee-saved registers, which is exactly what the `context` crate's
//! `Context::resume` does. A coroutine never migrates between workers --
//! `home_scheduler` (tracked by the `runtime` module, not here) is a
//! non-owning id, never a pointer back to the scheduler, to avoid the
//! natural cyclic-ownership trap (scheduler owns coroutines; coroutines
//! must not own the scheduler back).
//!
//! Suspending a coroutine from deep inside arbitrary user code (e.g. a
//! `Condition::wait` three stack frames down in a protocol parser) needs
//! a context to jump back to that isn't available as an ordinary function
//! argument at that point. Each worker thread keeps a thread-local slot,
//! `YIELD_CONTEXT`, holding exactly that: the context representing "back
//! on the dispatcher's stack, right after it resumed me". `suspend()`
//! swaps it out, transfers control, and stores the fresh context it gets
//! back for the next suspension.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use options::Options;

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Opaque, process-unique coroutine identifier. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(u64);

impl CoroutineId {
    pub fn from_raw(n: u64) -> CoroutineId {
        CoroutineId(n)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    fn next() -> CoroutineId {
        CoroutineId(NEXT_ID.fetch_add(1, Ordering::Relaxed) as u64)
    }
}

/// Lifecycle state of a coroutine, observed by the scheduler between
/// suspension points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// On the run queue or about to be placed on it.
    Runnable,
    /// Parked on a condition or a timer, waiting to be signalled.
    Parked,
    /// Entry function returned or panicked; stack may be reclaimed.
    Finished,
}

/// Why a suspended coroutine was resumed. Threaded through the context
/// switch as the `usize` payload so the woken code can tell an ordinary
/// wakeup from a timeout or a delivered cancellation without a separate
/// side channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resumption {
    Ok,
    TimedOut,
    Cancelled,
}

const RESUME_OK: usize = 0;
const RESUME_TIMED_OUT: usize = 1;
const RESUME_CANCELLED: usize = 2;
const FINISHED_SENTINEL: usize = usize::max_value();

impl Resumption {
    fn to_usize(self) -> usize {
        match self {
            Resumption::Ok => RESUME_OK,
            Resumption::TimedOut => RESUME_TIMED_OUT,
            Resumption::Cancelled => RESUME_CANCELLED,
        }
    }

    fn from_usize(v: usize) -> Resumption {
        match v {
            RESUME_TIMED_OUT => Resumption::TimedOut,
            RESUME_CANCELLED => Resumption::Cancelled,
            _ => Resumption::Ok,
        }
    }
}

type Entry = Box<FnBox>;

trait FnBox {
    fn call_box(self: Box<Self>);
}

impl<F: FnOnce()> FnBox for F {
    fn call_box(self: Box<F>) {
        (*self)()
    }
}

thread_local!(static YIELD_CONTEXT: Cell<Option<Context>> = Cell::new(None));

/// Suspend the coroutine currently running on this worker thread, handing
/// control back to whichever dispatcher resumed it. Returns the reason
/// the scheduler gives for the next wakeup. Panics if called off a
/// coroutine's stack (i.e. directly from a worker's dispatch loop).
pub fn suspend() -> Resumption {
    let transfer = YIELD_CONTEXT.with(|cell| {
        let ctx = cell
            .take()
            .expect("coroutine::suspend() called outside a running coroutine");
        unsafe { ctx.resume(RESUME_OK) }
    });
    YIELD_CONTEXT.with(|cell| cell.set(Some(transfer.context)));
    Resumption::from_usize(transfer.data)
}

extern "C" fn trampoline(t: Transfer) -> ! {
    // `data` is a thin pointer to a boxed `Entry` (itself a fat
    // trait-object pointer) -- the standard double-indirection trick for
    // moving a `Box<dyn FnOnce()>` through a `usize`.
    let entry: Entry = *unsafe { Box::from_raw(t.data as *mut Entry) };

    // Hand control back to `Coroutine::spawn`, which is only priming the
    // stack at this point; the real work starts on the next resume, once
    // the scheduler has a chance to enqueue this coroutine.
    let t2 = unsafe { t.context.resume(RESUME_OK) };
    YIELD_CONTEXT.with(|cell| cell.set(Some(t2.context)));

    let result = panic::catch_unwind(AssertUnwindSafe(|| entry.call_box()));
    if let Err(cause) = result {
        drop(cause);
    }

    // The entry function returned or panicked. Transfer back into the
    // dispatcher flagged as finished; this context is never entered
    // again, so looping here only guards against a dispatcher bug that
    // would otherwise resume a dead stack.
    loop {
        let ctx = YIELD_CONTEXT
            .with(|cell| cell.take())
            .expect("finished coroutine has no dispatcher context");
        let t = unsafe { ctx.resume(FINISHED_SENTINEL) };
        YIELD_CONTEXT.with(|cell| cell.set(Some(t.context)));
    }
}

/// A stackful coroutine. Owned exclusively by the scheduler that created
/// it until it is joined or reaped.
pub struct Coroutine {
    id: CoroutineId,
    name: Option<String>,
    state: State,
    cancel_requested: Cell<bool>,
    stack: Option<ProtectedFixedSizeStack>,
    /// The suspended context to resume into. `None` while running on this
    /// stack (the running context lives on the native call stack) and
    /// after the coroutine has finished.
    context: Option<Context>,
}

// The entry closure is moved onto the coroutine's own stack at resume
// time; nothing here is shared across threads without going through the
// scheduler's inbox, so a whole Coroutine can move between the host and
// its worker thread at spawn time, but never after.
unsafe impl Send for Coroutine {}

impl Coroutine {
    /// Allocate a coroutine with its own stack; the entry closure does
    /// not run until the first real `resume()`.
    pub fn spawn<F>(f: F, opts: Options) -> Coroutine
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = ProtectedFixedSizeStack::new(opts.stack_size)
            .expect("failed to allocate guarded coroutine stack");
        let context = Context::new(&stack, trampoline);

        let boxed: Entry = Box::new(f);
        let data = Box::into_raw(Box::new(boxed)) as usize;

        // Prime the trampoline: it immediately resumes back to us before
        // running `f`, so this call never executes user code.
        let transfer = unsafe { context.resume(data) };

        Coroutine {
            id: CoroutineId::next(),
            name: opts.name,
            state: State::Runnable,
            cancel_requested: Cell::new(false),
            stack: Some(stack),
            context: Some(transfer.context),
        }
    }

    pub fn id(&self) -> CoroutineId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().map(|s| s.as_str())
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    pub fn request_cancel(&self) {
        self.cancel_requested.set(true);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.get()
    }

    /// Resume this coroutine on the calling (scheduler) thread until it
    /// next calls `suspend()` or finishes, telling it why it's being
    /// woken.
    pub fn resume(&mut self, reason: Resumption) {
        debug_assert!(!self.is_finished(), "cannot resume a finished coroutine");
        let context = self
            .context
            .take()
            .expect("coroutine has no context to resume into");
        self.state = State::Runnable;
        let transfer = unsafe { context.resume(reason.to_usize()) };
        if transfer.data == FINISHED_SENTINEL {
            self.state = State::Finished;
            self.context = None;
        } else {
            self.context = Some(transfer.context);
        }
    }

    pub fn mark_parked(&mut self) {
        self.state = State::Parked;
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        // A non-finished coroutine being dropped only happens on worker
        // teardown; there is no well-defined way to run destructors still
        // pending on a stack nobody will ever resume into again, so the
        // stack is simply reclaimed unwound.
        self.context = None;
        self.stack = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn spawn_runs_entry_on_first_resume() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        let mut coro = Coroutine::spawn(
            move || ran2.store(true, Ordering::SeqCst),
            Options::default(),
        );
        assert!(!ran.load(Ordering::SeqCst));
        coro.resume(Resumption::Ok);
        assert!(ran.load(Ordering::SeqCst));
        assert!(coro.is_finished());
    }

    #[test]
    fn suspend_round_trips_the_resumption_reason() {
        let mut coro = Coroutine::spawn(
            || {
                let r = suspend();
                assert_eq!(r, Resumption::TimedOut);
            },
            Options::default(),
        );
        coro.resume(Resumption::Ok);
        assert!(!coro.is_finished());
        coro.resume(Resumption::TimedOut);
        assert!(coro.is_finished());
    }
}
