//! Global rate-limit lock.

use std::time::Duration;
use tokio::time::Instant;

/// Freezes every bucket until a deadline passes.
///
/// Pure time comparison; the scheduler decides when to look at it again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalLock {
    locked_until: Option<Instant>,
}

impl GlobalLock {
    /// An inactive lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether dispatching is frozen at `now`.
    pub fn is_active(&self, now: Instant) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }

    /// Freeze for `duration` from `now`. An existing later deadline is kept.
    pub fn activate(&mut self, now: Instant, duration: Duration) -> Instant {
        let until = now + duration;
        let until = self.locked_until.map_or(until, |existing| existing.max(until));
        self.locked_until = Some(until);
        until
    }

    /// Last deadline set, even if it already passed.
    pub fn locked_until(&self) -> Option<Instant> {
        self.locked_until
    }

    /// Deadline, only while it is still in the future.
    pub fn active_until(&self, now: Instant) -> Option<Instant> {
        self.locked_until.filter(|until| now < *until)
    }
}
