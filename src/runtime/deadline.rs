//! Absolute deadlines for bounded waits.
//!
//! The deadline is fixed once; every retry asks for the time remaining
//! from "now" so an interrupted wait can never extend the window.

use super::readiness::{Readiness, WaitOutcome, WatchSet};
use std::time::{Duration, Instant};
use tracing::trace;

/// Budgets too large for the clock are capped to this horizon.
const HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Longest single wait handed to a backend. poll(2) and epoll take an
/// `int` of milliseconds, so longer budgets are waited out in slices.
pub(crate) const MAX_SLICE: Duration = Duration::from_secs(24 * 60 * 60);

/// A fixed point in time after which a wait budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `budget` from now. Budgets past the clock's range are
    /// capped at a far-future instant.
    pub fn after(budget: Duration) -> Self {
        let now = Instant::now();
        let at = now
            .checked_add(budget)
            .or_else(|| now.checked_add(HORIZON))
            .or_else(|| now.checked_add(MAX_SLICE))
            .unwrap_or(now);
        Self::at(at)
    }

    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.at.saturating_duration_since(now)
    }
}

/// Wait on `set` until something is ready or `deadline` passes.
///
/// Interrupted waits are retried with the budget recomputed from the
/// absolute deadline, and budgets beyond `MAX_SLICE` are waited out one
/// slice at a time. Any other outcome is returned as is.
pub fn wait_until<R: Readiness + ?Sized>(
    readiness: &mut R,
    set: &WatchSet,
    deadline: Deadline,
) -> WaitOutcome {
    let mut retries = 0u32;
    loop {
        let remaining = deadline.remaining();
        let slice = remaining.min(MAX_SLICE);
        match readiness.wait(set, Some(slice)) {
            WaitOutcome::Interrupted => {
                retries += 1;
                trace!(
                    retries,
                    remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                    "Wait interrupted, retrying"
                );
            }
            WaitOutcome::TimedOut if remaining > slice => {
                trace!("Wait slice elapsed, continuing");
            }
            outcome => return outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::readiness::Interest;
    use std::thread;

    /// Returns `Interrupted` a fixed number of times, then `TimedOut`,
    /// recording the budget it was handed on every call.
    struct Interrupting {
        interrupts: usize,
        nap: Duration,
        seen: Vec<Duration>,
    }

    impl Readiness for Interrupting {
        fn wait(&mut self, _set: &WatchSet, timeout: Option<Duration>) -> WaitOutcome {
            self.seen.push(timeout.unwrap_or(Duration::MAX));
            thread::sleep(self.nap);
            if self.seen.len() <= self.interrupts {
                WaitOutcome::Interrupted
            } else {
                WaitOutcome::TimedOut
            }
        }
    }

    #[test]
    fn test_remaining_saturates() {
        let now = Instant::now();
        let deadline = Deadline::at(now);
        assert_eq!(deadline.remaining_at(now + Duration::from_secs(1)), Duration::ZERO);
        assert!(deadline.remaining().is_zero());

        let later = Deadline::at(now + Duration::from_secs(2));
        assert_eq!(later.remaining_at(now), Duration::from_secs(2));
    }

    #[test]
    fn test_interrupted_waits_shrink_budget() {
        let budget = Duration::from_millis(500);
        let deadline = Deadline::after(budget);
        let set = WatchSet::new().watch(0, Interest::READABLE);
        let mut readiness = Interrupting {
            interrupts: 4,
            nap: Duration::from_millis(10),
            seen: Vec::new(),
        };

        let outcome = wait_until(&mut readiness, &set, deadline);

        assert!(matches!(outcome, WaitOutcome::TimedOut));
        assert_eq!(readiness.seen.len(), 5);
        for pair in readiness.seen.windows(2) {
            assert!(pair[1] < pair[0], "budget grew: {:?}", readiness.seen);
        }
        assert!(readiness.seen[0] <= budget);

        // Four naps elapsed before the final wait; none of it was given back.
        let last = *readiness.seen.last().unwrap();
        assert!(last <= budget - readiness.nap * 4);
    }

    #[test]
    fn test_expired_deadline_passes_zero() {
        let deadline = Deadline::at(Instant::now());
        let set = WatchSet::new();
        let mut readiness = Interrupting {
            interrupts: 0,
            nap: Duration::ZERO,
            seen: Vec::new(),
        };

        let outcome = wait_until(&mut readiness, &set, deadline);

        assert!(matches!(outcome, WaitOutcome::TimedOut));
        assert_eq!(readiness.seen, vec![Duration::ZERO]);
    }

    #[test]
    fn test_huge_budget_does_not_overflow() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(deadline.remaining() > Duration::from_secs(50 * 365 * 24 * 60 * 60));

        let deadline = Deadline::after(Duration::from_secs(i64::MAX as u64));
        assert!(deadline.remaining() > MAX_SLICE);
    }

    /// Times out `slices` times, then reports the watched set ready.
    struct SlowReady {
        slices: usize,
        seen: Vec<Duration>,
    }

    impl Readiness for SlowReady {
        fn wait(&mut self, _set: &WatchSet, timeout: Option<Duration>) -> WaitOutcome {
            self.seen.push(timeout.unwrap_or(Duration::MAX));
            if self.seen.len() <= self.slices {
                WaitOutcome::TimedOut
            } else {
                WaitOutcome::Ready(crate::runtime::ReadySet::new())
            }
        }
    }

    #[test]
    fn test_long_budget_waits_in_slices() {
        let deadline = Deadline::after(Duration::MAX);
        let set = WatchSet::new().watch(0, Interest::READABLE);
        let mut readiness = SlowReady {
            slices: 2,
            seen: Vec::new(),
        };

        let outcome = wait_until(&mut readiness, &set, deadline);

        assert!(matches!(outcome, WaitOutcome::Ready(_)));
        assert_eq!(readiness.seen, vec![MAX_SLICE; 3]);
    }
}
