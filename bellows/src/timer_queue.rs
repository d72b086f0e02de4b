//! Timer queue: one timerfd per loop, readable when the earliest timer
//! expires.
//!
//! The queue keeps two ordered views of the same timer set. `by_expiry`,
//! keyed by `(expiration, sequence)`, makes "everything due by now" an
//! ordered prefix; `by_id`, keyed by sequence, makes cancellation a lookup
//! instead of a scan. The `cancelling` set closes the race where a periodic
//! timer is cancelled from inside a callback in the same expiry batch: the
//! timer has already been extracted, so the cancel is recorded and the
//! re-arm pass skips it.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics::TIMERS_FIRED;
use crate::sockets;
use crate::timer::{Timer, TimerId};

struct TimerSet {
    by_expiry: BTreeMap<(Instant, u64), Timer>,
    by_id: BTreeMap<u64, Instant>,
    cancelling: HashSet<u64>,
    calling_expired: bool,
}

pub(crate) struct TimerQueue {
    loop_: Weak<EventLoop>,
    timerfd: RawFd,
    #[allow(dead_code)] // held for registration lifetime
    channel: Arc<Channel>,
    state: Mutex<TimerSet>,
}

impl TimerQueue {
    pub(crate) fn new(event_loop: &Arc<EventLoop>) -> io::Result<TimerQueue> {
        let timerfd = sockets::create_timerfd()?;
        let channel = Channel::new(event_loop, timerfd);
        let weak = Arc::downgrade(event_loop);
        channel.set_read_callback(Box::new(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.timer_queue().handle_read();
            }
        }));
        // Always reading; the fd is disarmed with timerfd_settime, not by
        // dropping interest.
        channel.enable_reading();

        Ok(TimerQueue {
            loop_: Arc::downgrade(event_loop),
            timerfd,
            channel,
            state: Mutex::new(TimerSet {
                by_expiry: BTreeMap::new(),
                by_id: BTreeMap::new(),
                cancelling: HashSet::new(),
                calling_expired: false,
            }),
        })
    }

    /// Thread-safe. Schedules `timer` on the owning loop.
    pub(crate) fn add_timer(
        &self,
        callback: Box<dyn FnMut() + Send>,
        when: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let timer = Timer::new(callback, when, interval);
        let id = TimerId(timer.sequence());
        let event_loop = self.loop_.upgrade().expect("timer queue outlived its loop");
        let target = event_loop.clone();
        event_loop.run_in_loop(move || target.timer_queue().add_timer_in_loop(timer));
        id
    }

    /// Thread-safe. Always honoured: either the timer is removed before it
    /// fires, or (if it is firing right now) its re-arm is suppressed.
    pub(crate) fn cancel(&self, id: TimerId) {
        let event_loop = self.loop_.upgrade().expect("timer queue outlived its loop");
        let target = event_loop.clone();
        event_loop.run_in_loop(move || target.timer_queue().cancel_in_loop(id));
    }

    fn add_timer_in_loop(&self, timer: Timer) {
        self.assert_in_loop_thread();
        let when = timer.expiration();
        let earliest_changed = {
            let mut state = self.state.lock();
            let earliest = state.by_expiry.keys().next().map(|(at, _)| *at);
            let changed = earliest.map_or(true, |at| when < at);
            state.by_id.insert(timer.sequence(), when);
            state.by_expiry.insert((when, timer.sequence()), timer);
            changed
        };
        if earliest_changed {
            self.reset_timerfd(when);
        }
    }

    fn cancel_in_loop(&self, id: TimerId) {
        self.assert_in_loop_thread();
        let mut state = self.state.lock();
        if let Some(when) = state.by_id.remove(&id.0) {
            let removed = state.by_expiry.remove(&(when, id.0));
            debug_assert!(removed.is_some());
        } else if state.calling_expired {
            state.cancelling.insert(id.0);
        }
    }

    /// Timerfd readable: run every timer due by now, then re-arm.
    fn handle_read(&self) {
        self.assert_in_loop_thread();
        match sockets::read_timerfd(self.timerfd) {
            Ok(count) => trace!(count, "timerfd fired"),
            Err(e) => error!("timerfd read failed: {e}"),
        }
        let now = Instant::now();

        let mut expired: Vec<Timer> = {
            let mut state = self.state.lock();
            // Sequences never reach u64::MAX, so this key splits exactly at
            // "expiration <= now".
            let still_pending = state.by_expiry.split_off(&(now, u64::MAX));
            let due = mem::replace(&mut state.by_expiry, still_pending);
            for timer in due.values() {
                state.by_id.remove(&timer.sequence());
            }
            state.calling_expired = true;
            state.cancelling.clear();
            due.into_values().collect()
        };

        // Callbacks run without the lock so they can add or cancel timers.
        for timer in expired.iter_mut() {
            timer.run();
            TIMERS_FIRED.increment();
        }

        let next_expiration = {
            let mut state = self.state.lock();
            state.calling_expired = false;
            for mut timer in expired {
                if timer.repeat() && !state.cancelling.contains(&timer.sequence()) {
                    timer.restart(now);
                    state.by_id.insert(timer.sequence(), timer.expiration());
                    state
                        .by_expiry
                        .insert((timer.expiration(), timer.sequence()), timer);
                }
                // One-shots and cancelled periodics are dropped here.
            }
            state.by_expiry.keys().next().map(|(at, _)| *at)
        };

        if let Some(at) = next_expiration {
            self.reset_timerfd(at);
        }
    }

    fn reset_timerfd(&self, expiration: Instant) {
        if let Err(e) = sockets::arm_timerfd(self.timerfd, expiration) {
            error!("timerfd_settime failed: {e}");
        }
    }

    fn assert_in_loop_thread(&self) {
        if let Some(event_loop) = self.loop_.upgrade() {
            event_loop.assert_in_loop_thread();
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        sockets::close(self.timerfd);
    }
}
