// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! One-shot, coroutine-cooperative result channel backing coroutine join
//! (see `scheduler`). Grounded on the coio-rs lineage's `join_handle`
//! module (`examples/other_examples/.../scheduler.rs` imports
//! `join_handle::{self, JoinHandleReceiver}` and pairs it with a spawn
//! wrapper that `catch_unwind`s the entry closure) but traded its
//! `Barrier`/`Condvar` OS-thread blocking for a `Condition`, since here
//! the joining side is itself a coroutine parked cooperatively rather
//! than a thread descheduled by the kernel.

use std::sync::Arc;
use std::thread::Result as ThreadResult;

use cond::Condition;
use error::{Error, Result};
use runtime::processor::Processor;
use sync::spinlock::Spinlock;

struct Inner<T> {
    state: Spinlock<Option<ThreadResult<T>>>,
    cond: Condition,
}

/// The spawn side's half: delivered once, when the spawned coroutine's
/// wrapper closure finishes (whether it returned or panicked).
pub struct JoinHandleSender<T> {
    inner: Arc<Inner<T>>,
}

/// The caller's half, returned from `coroutine::spawn`.
pub struct JoinHandle<T> {
    inner: Arc<Inner<T>>,
}

unsafe impl<T: Send> Send for JoinHandle<T> {}
unsafe impl<T: Send> Send for JoinHandleSender<T> {}

/// Build a sender/handle pair bound to the worker running when this is
/// called -- `join()` must run on a coroutine belonging to that worker,
/// same restriction as `Condition::wait`.
pub fn handle_pair<T>() -> (JoinHandleSender<T>, JoinHandle<T>) {
    let owner = Processor::current_worker_id()
        .expect("join_handle::handle_pair called without a running worker");
    let cond = Condition::create(owner, Processor::current_sender());
    let inner = Arc::new(Inner {
        state: Spinlock::new(None),
        cond: cond,
    });
    (
        JoinHandleSender {
            inner: inner.clone(),
        },
        JoinHandle { inner: inner },
    )
}

impl<T> JoinHandleSender<T> {
    pub fn send(self, result: ThreadResult<T>) {
        *self.inner.state.lock() = Some(result);
        self.inner.cond.signal();
    }
}

impl<T> JoinHandle<T> {
    /// Wait for the spawned coroutine to finish, returning its value or
    /// an error if it panicked or the wait timed out / was cancelled.
    pub fn join(self, timeout_ms: Option<u64>) -> Result<T> {
        loop {
            if let Some(result) = self.inner.state.lock().take() {
                return result.map_err(|_| Error::Fatal("joined coroutine panicked".into()));
            }
            self.inner.cond.wait(timeout_ms)?;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use options::Options;
    use runtime::processor::Processor;
    use runtime::WorkerId;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc as StdArc;

    fn run<F: FnOnce() + Send + 'static>(entry: F) {
        let (mut processor, event_loop) = Processor::new(WorkerId::next(), "test".into());
        processor.run_to_completion(event_loop, entry, Options::default());
    }

    #[test]
    fn join_returns_the_spawned_coroutines_value() {
        let ok = StdArc::new(AtomicBool::new(false));
        let ok2 = ok.clone();
        run(move || {
            let (tx, rx) = handle_pair::<u32>();
            Processor::spawn_current(
                move || {
                    tx.send(Ok(42));
                },
                Options::default(),
            );
            let value = rx.join(Some(1_000)).expect("join");
            ok2.store(value == 42, Ordering::SeqCst);
        });
        assert!(ok.load(Ordering::SeqCst));
    }

    #[test]
    fn join_reports_a_panic_as_an_error() {
        let ok = StdArc::new(AtomicBool::new(false));
        let ok2 = ok.clone();
        run(move || {
            let (tx, rx) = handle_pair::<u32>();
            Processor::spawn_current(
                move || {
                    let result: ::std::thread::Result<u32> = Err(Box::new("boom"));
                    tx.send(result);
                },
                Options::default(),
            );
            ok2.store(rx.join(Some(1_000)).is_err(), Ordering::SeqCst);
        });
        assert!(ok.load(Ordering::SeqCst));
    }
}
