// Copyright 2015 The poolio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-worker timer wheel (C2).
//!
//! Grounded on `mm_clock_t` (`examples/original_source/src/mm_clock.h`):
//! a monotonic `now_ms` and timers keyed by `(deadline_ms, seq)`, the
//! strictly increasing per-clock sequence number breaking ties FIFO
//! between timers sharing a deadline. `heap` is a `BTreeMap` ordered on
//! that key so the earliest deadline is always its first entry; `index`
//! maps a timer's id back to its key so `del` can find and remove it with
//! one `HashMap` lookup plus one `BTreeMap` removal -- both O(log n), no
//! scan over the live timers.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use coroutine::CoroutineId;

/// Opaque handle to an armed timer, returned by `Clock::add` and required
/// by `Clock::del`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerId(u64);

/// An expired timer, returned by `step()` for the scheduler to act on.
pub struct Expired {
    pub id: TimerId,
    pub waiter: CoroutineId,
}

/// Per-worker ordered set of deadlines. Not `Send`/`Sync`: a clock belongs
/// to exactly one scheduler and is only ever touched from its own worker
/// thread.
pub struct Clock {
    epoch: Instant,
    now_ms: u64,
    heap: BTreeMap<(u64, u64), (u64, CoroutineId)>,
    index: HashMap<u64, (u64, u64)>,
    seq_next: u64,
    id_next: u64,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            epoch: Instant::now(),
            now_ms: 0,
            heap: BTreeMap::new(),
            index: HashMap::new(),
            seq_next: 0,
            id_next: 0,
        }
    }

    /// Refresh `now_ms` from the monotonic OS clock. Called once per
    /// scheduler iteration, never inside a dispatch loop.
    pub fn refresh_now(&mut self) {
        let elapsed = self.epoch.elapsed();
        self.now_ms = elapsed.as_secs() * 1000 + (elapsed.subsec_nanos() / 1_000_000) as u64;
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Arm a timer that will wake `waiter` at `deadline_ms` (absolute,
    /// same epoch as `now_ms`). O(log n): one `BTreeMap` insert plus one
    /// `HashMap` insert.
    pub fn add(&mut self, deadline_ms: u64, waiter: CoroutineId) -> TimerId {
        let id = self.id_next;
        self.id_next += 1;
        let seq = self.seq_next;
        self.seq_next += 1;
        let key = (deadline_ms, seq);
        self.heap.insert(key, (id, waiter));
        self.index.insert(id, key);
        TimerId(id)
    }

    /// Remove a timer before it fires. O(log n): `index` gives the key
    /// directly rather than scanning for it. A no-op if it already fired
    /// or was already removed.
    pub fn del(&mut self, timer: TimerId) {
        if let Some(key) = self.index.remove(&timer.0) {
            self.heap.remove(&key);
        }
    }

    /// The earliest live deadline, if any.
    pub fn min_deadline_ms(&self) -> Option<u64> {
        self.heap.keys().next().map(|&(deadline_ms, _)| deadline_ms)
    }

    /// Pop every timer whose deadline is `<= now_ms`, returning the
    /// waiters to wake, ordered by `(deadline_ms, seq)`.
    pub fn step(&mut self) -> Vec<Expired> {
        self.refresh_now();
        let mut expired = Vec::new();
        loop {
            let key = match self.heap.keys().next() {
                Some(&key) if key.0 <= self.now_ms => key,
                _ => break,
            };
            let (id, waiter) = self.heap.remove(&key).expect("key just read from the map");
            self.index.remove(&id);
            expired.push(Expired {
                id: TimerId(id),
                waiter,
            });
        }
        expired
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use coroutine::CoroutineId;

    fn cid(n: u64) -> CoroutineId {
        CoroutineId::from_raw(n)
    }

    #[test]
    fn step_fires_in_deadline_then_seq_order() {
        let mut clock = Clock::new();
        clock.refresh_now();
        let base = clock.now_ms();

        // Same deadline, inserted out of numeric order: seq must win.
        clock.add(base, cid(3));
        clock.add(base, cid(1));
        clock.add(base + 50, cid(2));

        let expired = clock.step();
        assert_eq!(expired.len(), 2);
        assert_eq!(expired[0].waiter, cid(3));
        assert_eq!(expired[1].waiter, cid(1));
        assert!(clock.min_deadline_ms().is_some());
    }

    #[test]
    fn del_suppresses_a_pending_timer() {
        let mut clock = Clock::new();
        clock.refresh_now();
        let base = clock.now_ms();
        let t = clock.add(base, cid(7));
        clock.del(t);
        assert!(clock.is_empty());
        assert_eq!(clock.step().len(), 0);
    }
}
