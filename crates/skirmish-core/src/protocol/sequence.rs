//! Lock-free counters for object ids and impact sequence numbers.
//!
//! # Where are counters used? (for beginners)
//!
//! Two things on the wire need a number that a peer never hands out twice:
//!
//! - **Object ids** – the second half of a [`crate::GameId`].  Every bullet,
//!   missile and decoy a peer launches takes the next value.  Object id 0 is
//!   reserved for the player itself, so object ids come from
//!   [`SequenceCounter::next_nonzero`].
//! - **Impact sequence numbers** – each damage event carries one so that a
//!   receiver can recognise a duplicate delivery (a resend, or a ledger replay
//!   of an impact it already applied) and apply the damage only once.
//!
//! The counter is an `AtomicU32`.  Calling [`SequenceCounter::next`] from
//! several threads at once never yields the same value twice, and no lock is
//! taken.

use std::sync::atomic::{AtomicU32, Ordering};

/// A thread-safe, monotonically increasing `u32` counter.
///
/// Wraps to 0 after `u32::MAX` without panicking.
///
/// # Examples
///
/// ```rust
/// use skirmish_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::starting_at(1);
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU32,
}

impl SequenceCounter {
    /// Creates a counter whose first value is 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a counter whose first value is `first`.
    pub fn starting_at(first: u32) -> Self {
        Self {
            inner: AtomicU32::new(first),
        }
    }

    /// Returns the next value and advances the counter.
    ///
    /// `Relaxed` ordering is enough: the value orders nothing but itself.
    pub fn next(&self) -> u32 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Like [`next`](Self::next), but steps over 0 when the counter wraps.
    pub fn next_nonzero(&self) -> u32 {
        loop {
            let value = self.next();
            if value != 0 {
                return value;
            }
        }
    }

    /// Returns the value the next call to [`next`](Self::next) will yield.
    pub fn current(&self) -> u32 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
