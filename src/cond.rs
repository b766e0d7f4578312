// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! One-shot condition variable (C3).
//!
//! Bound to a single owning worker at creation. `wait` must run on a
//! coroutine belonging to that worker; `signal` is safe from anywhere --
//! same-worker signals go straight onto the run queue, cross-worker ones
//! route through the owner's inbox (`runtime::Message::Ready`), never
//! touching the owner's run queue directly (see the runtime module docs).

use std::sync::Arc;

use mio;

use coroutine::{self, CoroutineId, Resumption};
use error::{Error, Result};
use runtime::processor::Processor;
use runtime::{Message, WorkerId};
use sync::spinlock::Spinlock;

struct State {
    signaled: bool,
    waiter: Option<CoroutineId>,
}

struct Inner {
    state: Spinlock<State>,
    owner: WorkerId,
    sender: mio::Sender<Message>,
}

/// A one-shot wakeup primitive. Cheaply cloneable -- clones share the
/// same underlying slot, which is how `io_handle` hands a condition to
/// the poller's token table while a coroutine also holds one to wait on.
#[derive(Clone)]
pub struct Condition(Arc<Inner>);

impl Condition {
    /// Create a condition owned by `owner`, reachable from other workers
    /// through `sender` (that worker's event-loop channel).
    pub fn create(owner: WorkerId, sender: mio::Sender<Message>) -> Condition {
        Condition(Arc::new(Inner {
            state: Spinlock::new(State {
                signaled: false,
                waiter: None,
            }),
            owner: owner,
            sender: sender,
        }))
    }

    pub fn owner(&self) -> WorkerId {
        self.0.owner
    }

    /// Wake the parked waiter, if any; otherwise latch `signaled` so the
    /// next `wait` returns immediately instead of parking.
    pub fn signal(&self) {
        let waiter = {
            let mut state = self.0.state.lock();
            match state.waiter.take() {
                Some(id) => Some(id),
                None => {
                    state.signaled = true;
                    None
                }
            }
        };

        if let Some(id) = waiter {
            if Processor::current_worker_id() == Some(self.0.owner) {
                Processor::make_ready_current(id, Resumption::Ok);
            } else {
                let _ = self.0.sender.send(Message::Ready(id));
            }
        }
    }

    /// Park the calling coroutine until `signal`, returning early if
    /// already signaled. `None` disables the timeout. Must be called on
    /// a coroutine belonging to this condition's owning worker.
    pub fn wait(&self, timeout_ms: Option<u64>) -> Result<()> {
        let id = Processor::current_id()
            .expect("Condition::wait called without a running coroutine");
        debug_assert_eq!(
            Processor::current_worker_id(),
            Some(self.0.owner),
            "Condition waited on from a worker other than its owner"
        );

        {
            let mut state = self.0.state.lock();
            if state.signaled {
                state.signaled = false;
                return Ok(());
            }
            debug_assert!(state.waiter.is_none(), "condition already has a waiter");
            state.waiter = Some(id);
        }

        let timer = timeout_ms.and_then(|ms| Processor::clock_add(ms, id));

        Processor::mark_current_parked();
        let resumption = coroutine::suspend();

        match resumption {
            Resumption::Ok => {
                if let Some(t) = timer {
                    Processor::clock_del(t);
                }
                Ok(())
            }
            Resumption::TimedOut => {
                self.0.state.lock().waiter = None;
                Err(Error::Timeout)
            }
            Resumption::Cancelled => {
                if let Some(t) = timer {
                    Processor::clock_del(t);
                }
                self.0.state.lock().waiter = None;
                Err(Error::Cancelled)
            }
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
    use std::sync::Arc;

    fn run<F: FnOnce() + Send + 'static>(entry: F) {
        let (mut processor, event_loop) = Processor::new(WorkerId::next(), "test".into());
        processor.run_to_completion(event_loop, entry, Options::default());
    }

    fn new_cond() -> Condition {
        Condition::create(
            Processor::current_worker_id().unwrap(),
            Processor::current_sender(),
        )
    }

    #[test]
    fn signal_before_wait_is_observed_immediately() {
        let ok = Arc::new(AtomicBool::new(false));
        let ok2 = ok.clone();
        run(move || {
            let cond = new_cond();
            cond.signal();
            let result = cond.wait(Some(1_000));
            ok2.store(result.is_ok(), Ordering::SeqCst);
        });
        assert!(ok.load(Ordering::SeqCst));
    }

    #[test]
    fn a_sibling_coroutine_can_wake_a_parked_waiter() {
        // The signaling coroutine is only spawned (queued), not run, until
        // this one parks -- exercising the "wake a waiter" path rather
        // than the "latch signaled" one above.
        let ok = Arc::new(AtomicBool::new(false));
        let ok2 = ok.clone();
        run(move || {
            let cond = new_cond();
            let signaler = cond.clone();
            Processor::spawn_current(
                move || {
                    signaler.signal();
                },
                Options::default(),
            );
            let result = cond.wait(Some(1_000));
            ok2.store(result.is_ok(), Ordering::SeqCst);
        });
        assert!(ok.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_without_a_signal_times_out() {
        let timed_out = Arc::new(AtomicBool::new(false));
        let timed_out2 = timed_out.clone();
        run(move || {
            let cond = new_cond();
            let result = cond.wait(Some(10));
            timed_out2.store(result.is_err(), Ordering::SeqCst);
        });
        assert!(timed_out.load(Ordering::SeqCst));
    }
}
