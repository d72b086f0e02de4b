//! Timer entries and their identities.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of unique timer sequence numbers.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Opaque handle for cancelling a scheduled timer.
///
/// Wraps the timer's sequence number, which is unique for the process
/// lifetime, so a stale id can never cancel a newer timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) struct Timer {
    callback: Box<dyn FnMut() + Send>,
    expiration: Instant,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub(crate) fn new(
        callback: Box<dyn FnMut() + Send>,
        when: Instant,
        interval: Option<Duration>,
    ) -> Timer {
        Timer {
            callback,
            expiration: when,
            interval,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub(crate) fn run(&mut self) {
        (self.callback)();
    }

    pub(crate) fn expiration(&self) -> Instant {
        self.expiration
    }

    pub(crate) fn repeat(&self) -> bool {
        self.interval.is_some()
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Re-arm a periodic timer relative to `now` (drift-reset policy).
    pub(crate) fn restart(&mut self, now: Instant) {
        if let Some(interval) = self.interval {
            self.expiration = now + interval;
        }
    }
}
