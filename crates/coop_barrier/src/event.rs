//! A level-triggered, manual-reset, multi-waiter wait primitive.
//!
//! This is the "Event" collaborator the barrier's arrival protocol is built on: `set`/`reset` flip
//! the level, `is_set` snapshots it, and `wait_one`/`wait_one_infinite` block until the event is set
//! (or, for the timed variant, until a deadline passes). Unlike [`crate::sync`]'s other primitives
//! this one must support an arbitrary number of simultaneous waiters, because every participant that
//! hasn't yet arrived in a phase can be parked on the same event at once. That rules out the
//! thread-parking approach used elsewhere in this kind of crate for single-consumer counters; the
//! nearest fit in this corpus is the standard library's own `Barrier`, which pairs a `Mutex`-guarded
//! flag with a `Condvar` and wakes everyone with `notify_all`. This event does the same thing, generalized
//! to set/reset/is_set instead of a one-shot generation counter.

use crate::sync::{Condvar, Mutex};

#[cfg(not(loom))]
use std::time::{Duration, Instant};

/// A manual-reset event: stays set until explicitly reset, and wakes every waiter on `set`.
pub struct ManualResetEvent {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl ManualResetEvent {
    pub fn new(initially_set: bool) -> Self {
        Self {
            state: Mutex::new(initially_set),
            condvar: Condvar::new(),
        }
    }

    /// Set the event, waking every thread currently blocked in `wait_one`/`wait_one_infinite`.
    pub fn set(&self) {
        let mut guard = self.state.lock().unwrap();
        *guard = true;
        drop(guard);
        self.condvar.notify_all();
    }

    /// Reset the event to the unset level. Does not wake anyone; resetting is only ever done by the
    /// same thread that is about to set the opposite event (see `Barrier`'s phase-completion step).
    pub fn reset(&self) {
        let mut guard = self.state.lock().unwrap();
        *guard = false;
    }

    /// Snapshot whether the event is currently set. Racy by construction: the result can be stale
    /// the instant it's returned. Callers (see `Barrier::add_participants`) only use this to decide
    /// whether a reset is worth attempting, not to make correctness-critical decisions alone.
    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Block until the event is set. Never times out; this is the path loom explores.
    pub fn wait_one_infinite(&self) {
        let mut guard = self.state.lock().unwrap();
        while !*guard {
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    /// Block until the event is set or `timeout` elapses. Returns `true` if the event was observed
    /// set, `false` on timeout.
    ///
    /// Not available under loom: loom has no model for timed waits (same reason
    /// `std::thread::park_timeout` is unavailable there, see `crate::sync`).
    #[cfg(not(loom))]
    pub fn wait_one_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().unwrap();
        while !*guard {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, timeout_result) = self.condvar.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if timeout_result.timed_out() && !*guard {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::wrap_test;

    #[test]
    fn starts_in_requested_state() {
        wrap_test(|| {
            assert!(ManualResetEvent::new(true).is_set());
            assert!(!ManualResetEvent::new(false).is_set());
        });
    }

    #[test]
    fn set_then_reset() {
        wrap_test(|| {
            let evt = ManualResetEvent::new(false);
            evt.set();
            assert!(evt.is_set());
            evt.reset();
            assert!(!evt.is_set());
        });
    }

    #[test]
    fn wait_one_infinite_wakes_on_set() {
        wrap_test(|| {
            use crate::sync::{spawn, Arc};

            let evt = Arc::new(ManualResetEvent::new(false));
            let waiter = evt.clone();
            let jh = spawn(move || waiter.wait_one_infinite());
            evt.set();
            jh.join().unwrap();
        });
    }

    #[test]
    fn wait_one_infinite_returns_immediately_if_already_set() {
        wrap_test(|| {
            let evt = ManualResetEvent::new(true);
            evt.wait_one_infinite();
        });
    }
}
