//! The rendezvous barrier itself.
//!
//! A [`Barrier`] lets a dynamically sized set of participant threads rendezvous in repeating
//! *phases*: every participant calls [`Barrier::signal_and_wait`] (or the timed variant) once per
//! phase, and all of them are released together once the last one arrives. A user-supplied callback,
//! if any, runs exactly once per phase on the thread that completed it, before anyone is released.
//!
//! The implementation packs `current` (arrivals so far), `total` (registered participants), and a
//! one-bit phase sense into a single `u32`, mutated exclusively through compare-and-swap — the same
//! packed-word CAS shape `audio_synchronization::generational_atomic`'s `GenerationalAtomicU32`
//! uses for its own lock-free state. Two alternating [`ManualResetEvent`]s (one per phase parity)
//! are the only blocking points; everything else is lock-free.

use std::time::Duration;

use crate::event::ManualResetEvent;
use crate::gc_safe::{in_gc_safe_region, GcSafeRegion, NoopGcSafeRegion};
use crate::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use crate::sync::spin_loop;

/// The largest number of participants a barrier can hold; dictated by the 15 bits of the packed
/// state word reserved for `total` (and, symmetrically, `current`).
pub const MAX_PARTICIPANTS: u32 = 0x7FFF;

const TOTAL_MASK: u32 = 0x0000_7FFF;
const CURRENT_MASK: u32 = 0x7FFF_0000;
const CURRENT_SHIFT: u32 = 16;
const PHASE_SENSE_MASK: u32 = 0x8000_0000;

/// The callback invoked exactly once per completed phase, on the thread that completed it.
pub type PhaseCallback = Box<dyn Fn() + Send + Sync + 'static>;

#[inline(always)]
fn pack(current: u32, total: u32, sense: bool) -> u32 {
    debug_assert!(current <= MAX_PARTICIPANTS);
    debug_assert!(total <= MAX_PARTICIPANTS);
    let mut word = (current & MAX_PARTICIPANTS) << CURRENT_SHIFT;
    word |= total & TOTAL_MASK;
    if !sense {
        word |= PHASE_SENSE_MASK;
    }
    word
}

#[inline(always)]
fn unpack(word: u32) -> (u32, u32, bool) {
    let current = (word & CURRENT_MASK) >> CURRENT_SHIFT;
    let total = word & TOTAL_MASK;
    let sense = (word & PHASE_SENSE_MASK) == 0;
    (current, total, sense)
}

/// Outcome of the arrival CAS loop: either this thread finished the phase outright, or it must now
/// wait on the event for the sense it arrived under.
enum Arrival {
    PhaseCompleted,
    MustWait { sense_before: bool, phase: u64 },
}

/// A multi-phase rendezvous barrier with a dynamically adjustable participant count.
///
/// `R` is the [`GcSafeRegion`] implementation bracketing this barrier's blocking waits; it defaults
/// to [`NoopGcSafeRegion`] and only needs naming by callers embedding the barrier in a
/// cooperatively-suspended runtime.
pub struct Barrier<R: GcSafeRegion = NoopGcSafeRegion> {
    /// Packed `(current, total, phase_sense)`. See module docs.
    state: AtomicU32,
    /// How many phases have completed. Phase 0 is the initial phase.
    phase: AtomicU64,
    /// Set when an even-numbered phase completes; waited on by participants that arrived during one.
    even_event: ManualResetEvent,
    /// Set when an odd-numbered phase completes; waited on by participants that arrived during one.
    odd_event: ManualResetEvent,
    callback: Option<PhaseCallback>,
    gc_region: R,
}

impl Barrier<NoopGcSafeRegion> {
    /// Create a barrier for `total_participants` threads with no host-runtime GC-safe-point
    /// integration.
    ///
    /// # Panics
    ///
    /// Panics if `total_participants > MAX_PARTICIPANTS`.
    pub fn new(total_participants: u32, callback: Option<PhaseCallback>) -> Self {
        Self::with_gc_safe_region(total_participants, callback, NoopGcSafeRegion)
    }
}

impl<R: GcSafeRegion> Barrier<R> {
    /// Create a barrier whose blocking waits are bracketed by `gc_region`.
    ///
    /// # Panics
    ///
    /// Panics if `total_participants > MAX_PARTICIPANTS`.
    pub fn with_gc_safe_region(
        total_participants: u32,
        callback: Option<PhaseCallback>,
        gc_region: R,
    ) -> Self {
        assert!(
            total_participants <= MAX_PARTICIPANTS,
            "total_participants ({total_participants}) exceeds MAX_PARTICIPANTS ({MAX_PARTICIPANTS})"
        );

        Self {
            state: AtomicU32::new(pack(0, total_participants, true)),
            phase: AtomicU64::new(0),
            even_event: ManualResetEvent::new(false),
            odd_event: ManualResetEvent::new(true),
            callback,
            gc_region,
        }
    }

    /// Consume the barrier, asserting that no participant is mid-phase.
    ///
    /// # Panics
    ///
    /// Panics if any participant has arrived in the current phase but not yet been released. It is
    /// the caller's responsibility to ensure no participant is inside a wait when this is called.
    pub fn destroy(self) {
        let (current, _, _) = unpack(self.state.load(Ordering::Acquire));
        assert_eq!(
            current, 0,
            "destroy called with {current} participant(s) still inside the current phase"
        );
    }

    /// The number of registered participants.
    pub fn participant_count(&self) -> u32 {
        unpack(self.state.load(Ordering::Relaxed)).1
    }

    /// The number of registered participants that have not yet arrived in the current phase.
    pub fn participants_remaining(&self) -> u32 {
        let (current, total, _) = unpack(self.state.load(Ordering::Relaxed));
        total - current
    }

    /// How many phases have completed. Phase 0 is the initial phase; this never decreases.
    pub fn current_phase(&self) -> u64 {
        self.phase.load(Ordering::Acquire)
    }

    /// Register `n` additional participants, returning the phase number they will join.
    ///
    /// If the current phase is in the process of completing (the sense has flipped but the phase
    /// counter and events haven't caught up yet), this blocks until that completion finishes, so the
    /// new participants never race a phase transition they didn't observe.
    ///
    /// # Panics
    ///
    /// Panics if `total + n` would exceed `MAX_PARTICIPANTS`.
    pub fn add_participants(&self, n: u32) -> u64 {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let (current, total, sense) = unpack(old);
            let new_total = total.checked_add(n).unwrap_or(u32::MAX);
            assert!(
                new_total <= MAX_PARTICIPANTS,
                "add_participants({n}) would push total participants to {new_total}, past MAX_PARTICIPANTS ({MAX_PARTICIPANTS})"
            );

            if self
                .state
                .compare_exchange(old, pack(current, new_total, sense), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let phase = self.phase.load(Ordering::Acquire);
                // If the sense no longer matches the phase parity, the completer has flipped the sense
                // but hasn't incremented `phase` yet: these new participants belong to the next phase.
                let new_phase = if sense != (phase % 2 == 0) { phase + 1 } else { phase };

                if new_phase != phase {
                    let opposite = if sense { &self.odd_event } else { &self.even_event };
                    in_gc_safe_region(&self.gc_region, || opposite.wait_one_infinite());
                } else if sense && self.even_event.is_set() {
                    // The completer incremented `phase` but hasn't reset the opposite event yet; do it
                    // here so a participant that arrives next doesn't sail through a stale set event.
                    self.even_event.reset();
                } else if !sense && self.odd_event.is_set() {
                    self.odd_event.reset();
                }

                return new_phase;
            }

            spin_loop();
        }
    }

    /// Remove `n` participants. If doing so means every remaining participant has already arrived in
    /// the current phase, this completes the phase (running the callback) exactly as if the last
    /// arrival had done so.
    ///
    /// # Panics
    ///
    /// Panics if `n > participant_count()`, or if removing `n` would leave fewer registered
    /// participants than have already arrived this phase.
    pub fn remove_participants(&self, n: u32) {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let (current, total, sense) = unpack(old);
            assert!(
                total >= n,
                "remove_participants({n}) on a barrier with only {total} participant(s)"
            );
            let remaining = total - n;
            assert!(
                remaining >= current,
                "remove_participants({n}) would leave {remaining} registered participant(s) but {current} have already arrived this phase"
            );

            if remaining > 0 && current == remaining {
                if self
                    .state
                    .compare_exchange(old, pack(0, remaining, !sense), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.finish_phase(sense);
                    return;
                }
            } else if self
                .state
                .compare_exchange(old, pack(current, remaining, sense), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }

            spin_loop();
        }
    }

    /// Arrive at the barrier and block until every other registered participant has too.
    pub fn signal_and_wait(&self) {
        let completed = self.signal_and_timedwait_impl(None);
        debug_assert!(completed, "an untimed wait must always report completion");
    }

    /// Arrive at the barrier and block until every other participant arrives or `timeout` elapses.
    ///
    /// Returns `true` if the phase completed before the timeout, `false` if the timeout expired and
    /// this call's arrival was successfully rolled back.
    #[cfg(not(loom))]
    pub fn signal_and_timedwait(&self, timeout: Duration) -> bool {
        self.signal_and_timedwait_impl(Some(timeout))
    }

    fn signal_and_timedwait_impl(&self, timeout: Option<Duration>) -> bool {
        let (sense_before, phase) = match self.arrive() {
            Arrival::PhaseCompleted => return true,
            Arrival::MustWait { sense_before, phase } => (sense_before, phase),
        };

        let event = if sense_before { &self.even_event } else { &self.odd_event };

        if self.discontinuous_wait(event, timeout, phase) {
            return true;
        }

        // Timed out: try to roll back this call's arrival.
        loop {
            let old = self.state.load(Ordering::Acquire);
            let (current, total, sense_now) = unpack(old);
            let phase_now = self.phase.load(Ordering::Acquire);

            if phase_now > phase || sense_now != sense_before {
                // Lost the race: the phase completed between our timeout and now. Don't return before
                // the events are set/reset, or we could re-enter the next phase ahead of a still-stale
                // reset event.
                self.wait_for_current_phase(event, phase);
                return true;
            }

            if self
                .state
                .compare_exchange(old, pack(current - 1, total, sense_before), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return false;
            }

            spin_loop();
        }
    }

    /// The arrival CAS loop shared by `signal_and_wait`/`signal_and_timedwait`.
    fn arrive(&self) -> Arrival {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let (current, total, sense_before) = unpack(old);
            assert!(total > 0, "signal_and_wait called on a barrier with no registered participants");
            let phase = self.phase.load(Ordering::Acquire);

            // current == 0 here should mean we're at the start of a fresh phase. If the sense doesn't
            // match the phase parity, a phase finished between loads above, or more threads arrived
            // than were ever registered.
            assert!(
                !(current == 0 && sense_before != (phase % 2 == 0)),
                "barrier over-arrival: current is 0 but phase {phase} is inconsistent with the observed \
                 sense; more threads signaled than the {total} registered participant(s)"
            );

            if current + 1 == total {
                if self
                    .state
                    .compare_exchange(old, pack(0, total, !sense_before), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.finish_phase(sense_before);
                    return Arrival::PhaseCompleted;
                }
            } else if self
                .state
                .compare_exchange(old, pack(current + 1, total, sense_before), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Arrival::MustWait { sense_before, phase };
            }

            spin_loop();
        }
    }

    /// Run on the last arriver, after the CAS that zeroed `current` and flipped the sense: invoke the
    /// callback, then advance `phase` and flip which event is set.
    ///
    /// Ordering is mandatory: callback, then phase increment, then reset-opposite, then set-current.
    /// Setting the current event before resetting the opposite one would let a participant that just
    /// arrived for the next phase pass straight through a stale set event from two phases back.
    fn finish_phase(&self, observed_sense: bool) {
        if let Some(callback) = &self.callback {
            callback();
        }

        self.phase.fetch_add(1, Ordering::AcqRel);

        if observed_sense {
            self.odd_event.reset();
            self.even_event.set();
        } else {
            self.even_event.reset();
            self.odd_event.set();
        }
    }

    /// Wait on `event` for up to `timeout` (or forever), but re-check every `max_wait` (doubling up to
    /// a 10s ceiling each iteration) in case `event` gets reset out from under us by a phase two
    /// transitions ahead of the one we're waiting on.
    #[cfg(not(loom))]
    fn discontinuous_wait(&self, event: &ManualResetEvent, timeout: Option<Duration>, observed_phase: u64) -> bool {
        let mut max_wait = Duration::from_millis(100);
        let ceiling = Duration::from_millis(10_000);
        let mut remaining = timeout;

        while observed_phase == self.phase.load(Ordering::Acquire) {
            let wait_time = match remaining {
                Some(r) => max_wait.min(r),
                None => max_wait,
            };

            let signaled = in_gc_safe_region(&self.gc_region, || event.wait_one_timeout(wait_time));
            if signaled {
                return true;
            }

            if let Some(r) = remaining {
                if r <= wait_time {
                    return false;
                }
                remaining = Some(r - wait_time);
            }

            max_wait = max_wait.saturating_mul(2).min(ceiling);
        }

        // The observed phase moved on without us noticing a signal; make sure the event is actually
        // set (or that the phase has moved far enough that it can't still be mid-reset for us) before
        // reporting success.
        self.wait_for_current_phase(event, observed_phase);
        true
    }

    #[cfg(loom)]
    fn discontinuous_wait(&self, event: &ManualResetEvent, _timeout: Option<Duration>, _observed_phase: u64) -> bool {
        in_gc_safe_region(&self.gc_region, || event.wait_one_infinite());
        true
    }

    /// Spin until `event` is observed set, or until two phases have passed since `observed_phase`
    /// (meaning the event was already reset again for a later phase, so it's not coming back set).
    fn wait_for_current_phase(&self, event: &ManualResetEvent, observed_phase: u64) {
        while !event.is_set() && self.phase.load(Ordering::Acquire).saturating_sub(observed_phase) <= 1 {
            spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn pack_unpack_roundtrip(
            current in 0u32..=MAX_PARTICIPANTS,
            total in 0u32..=MAX_PARTICIPANTS,
            sense: bool,
        ) {
            let (c, t, s) = unpack(pack(current, total, sense));
            prop_assert_eq!(c, current);
            prop_assert_eq!(t, total);
            prop_assert_eq!(s, sense);
        }
    }

    #[test]
    fn sense_true_clears_high_bit() {
        assert_eq!(pack(0, 0, true) & PHASE_SENSE_MASK, 0);
        assert_eq!(pack(0, 0, false) & PHASE_SENSE_MASK, PHASE_SENSE_MASK);
    }

    #[test]
    fn fresh_barrier_reports_initial_state() {
        crate::sync::wrap_test(|| {
            let barrier = Barrier::new(3, None);
            assert_eq!(barrier.participant_count(), 3);
            assert_eq!(barrier.participants_remaining(), 3);
            assert_eq!(barrier.current_phase(), 0);
        });
    }

    #[test]
    fn single_participant_completes_its_own_phase() {
        crate::sync::wrap_test(|| {
            use crate::sync::atomic::{AtomicU32 as Counter, Ordering as O};
            use crate::sync::Arc;

            let calls = Arc::new(Counter::new(0));
            let calls_for_cb = calls.clone();
            let barrier = Barrier::new(1, Some(Box::new(move || {
                calls_for_cb.fetch_add(1, O::SeqCst);
            })));

            assert_eq!(barrier.participants_remaining(), 1);
            assert_eq!(barrier.current_phase(), 0);

            barrier.signal_and_wait();

            assert_eq!(barrier.current_phase(), 1);
            assert_eq!(calls.load(O::SeqCst), 1);
            barrier.destroy();
        });
    }

    #[test]
    fn two_threads_rendezvous_under_loom() {
        crate::sync::wrap_test(|| {
            use crate::sync::{spawn, Arc};

            let barrier = Arc::new(Barrier::new(2, None));
            let other = barrier.clone();
            let jh = spawn(move || other.signal_and_wait());

            barrier.signal_and_wait();
            jh.join().unwrap();

            assert_eq!(barrier.current_phase(), 1);
        });
    }

    #[test]
    fn single_participant_barrier_advances_across_repeated_calls() {
        // Calling signal_and_wait twice in a row from the same thread on a one-participant barrier
        // is not an over-arrival: each call completes its own phase in full before returning.
        crate::sync::wrap_test(|| {
            let barrier = Barrier::new(1, None);
            barrier.signal_and_wait();
            assert_eq!(barrier.current_phase(), 1);
            barrier.signal_and_wait();
            assert_eq!(barrier.current_phase(), 2);
        });
    }
}
