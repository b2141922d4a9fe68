//! A lock-free, multi-phase thread rendezvous barrier with a dynamically adjustable participant
//! count.
//!
//! [`Barrier`] lets a set of participant threads block at a repeating synchronization point —
//! called a *phase* — until every registered participant has arrived, then releases them all
//! together. An optional callback runs exactly once per phase, on whichever thread drove the
//! phase to completion, before anyone is released. Unlike [`std::sync::Barrier`], participants
//! can be added or removed mid-flight via [`Barrier::add_participants`] and
//! [`Barrier::remove_participants`], and arrivals can be timed out and rolled back via
//! [`Barrier::signal_and_timedwait`].
//!
//! The packed-state and alternating-event technique this barrier is built on is the same one
//! `audio_synchronization`'s other primitives in this corpus use for lock-free coordination; see
//! the `barrier` module for the full design rationale.

pub mod barrier;
pub mod event;
pub mod gc_safe;
mod sync;

pub use barrier::{Barrier, PhaseCallback, MAX_PARTICIPANTS};
pub use event::ManualResetEvent;
pub use gc_safe::{GcSafeRegion, NoopGcSafeRegion};
