//! Per-thread reactor.
//!
//! An `EventLoop` is pinned to the thread that created it. One iteration:
//! wait on the poller (10 s cap), dispatch every ready channel, then drain
//! the pending-task queue. Everything except the explicitly thread-safe
//! entry points (`run_in_loop`, `queue_in_loop`, the timer adapters,
//! `wakeup`, `quit`) must be called from the owning thread; violations are
//! fatal.
//!
//! Cross-thread work lands in a mutex-guarded task vector. The enqueue
//! writes one tick into an eventfd registered with the poller, so a loop
//! blocked in the wait wakes immediately. The drain swaps the vector out
//! under the lock and runs the local copy: a task that enqueues further
//! tasks neither deadlocks nor starves I/O, because the new tasks run in
//! the next iteration.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::channel::Channel;
use crate::error::Error;
use crate::metrics::LOOP_WAKEUPS;
use crate::poller::{self, Poller};
use crate::sockets;
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;

const POLL_TIME_MS: i32 = 10_000;

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

pub struct EventLoop {
    thread_id: ThreadId,
    poller: Mutex<Box<dyn Poller>>,
    timers: OnceLock<TimerQueue>,
    wakeup_fd: RawFd,
    #[allow(dead_code)] // held for registration lifetime
    wakeup_channel: OnceLock<Arc<Channel>>,
    pending_tasks: Mutex<Vec<Task>>,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending_tasks: AtomicBool,
    iteration: AtomicU64,
    poll_return_time: Mutex<Instant>,
}

impl EventLoop {
    /// Create the event loop owned by the current thread.
    ///
    /// Fatal if this thread already owns a loop.
    pub fn new() -> Result<Arc<EventLoop>, Error> {
        sockets::ignore_sigpipe();

        if Self::current_thread_loop().is_some() {
            error!(
                thread = ?thread::current().id(),
                "another EventLoop already exists in this thread"
            );
            panic!("one EventLoop per thread");
        }

        let poller = poller::new_default_poller()?;
        let wakeup_fd = sockets::create_eventfd()?;

        let event_loop = Arc::new(EventLoop {
            thread_id: thread::current().id(),
            poller: Mutex::new(poller),
            timers: OnceLock::new(),
            wakeup_fd,
            wakeup_channel: OnceLock::new(),
            pending_tasks: Mutex::new(Vec::new()),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            poll_return_time: Mutex::new(Instant::now()),
        });
        CURRENT_LOOP.with(|slot| *slot.borrow_mut() = Arc::downgrade(&event_loop));

        // The wakeup channel reads the counter only to clear readiness.
        let wakeup_channel = Channel::new(&event_loop, wakeup_fd);
        wakeup_channel.set_read_callback(Box::new(move |_| {
            let n = sockets::read_eventfd(wakeup_fd);
            if n != 8 {
                error!("wakeup read returned {n} bytes instead of 8");
            }
        }));
        wakeup_channel.enable_reading();
        let _ = event_loop.wakeup_channel.set(wakeup_channel);

        let timers = TimerQueue::new(&event_loop)?;
        if event_loop.timers.set(timers).is_err() {
            unreachable!("timer queue initialized twice");
        }

        debug!(thread = ?event_loop.thread_id, "EventLoop created");
        Ok(event_loop)
    }

    /// The loop owned by the calling thread, if one exists.
    pub fn current_thread_loop() -> Option<Arc<EventLoop>> {
        CURRENT_LOOP.with(|slot| slot.borrow().upgrade())
    }

    /// Run the reactor until [`quit`](Self::quit). Owning thread only.
    pub fn run(&self) {
        assert!(!self.looping.load(Ordering::Relaxed));
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Relaxed);
        debug!("event loop start");

        let mut active_channels: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active_channels.clear();
            let poll_return = self.poller.lock().poll(POLL_TIME_MS, &mut active_channels);
            *self.poll_return_time.lock() = poll_return;
            self.iteration.fetch_add(1, Ordering::Relaxed);

            self.event_handling.store(true, Ordering::Relaxed);
            for channel in &active_channels {
                trace!(events = %channel.revents_to_string(), "dispatch");
                channel.handle_event(poll_return);
            }
            self.event_handling.store(false, Ordering::Relaxed);

            self.do_pending_tasks();
        }

        debug!("event loop stop");
        self.looping.store(false, Ordering::Relaxed);
    }

    /// Ask the loop to exit after its current iteration. Thread-safe; does
    /// not interrupt a running callback.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` on the owning thread: inline when already there,
    /// otherwise queued. Thread-safe.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the next drain, never running it inline.
    /// Thread-safe.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending_tasks.lock().push(Box::new(task));

        // A queue from off-thread needs the wakeup; so does a queue made
        // while the drain itself is running, or the task would wait out a
        // full poll timeout.
        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Number of tasks waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.pending_tasks.lock().len()
    }

    /// Run `callback` at `when`. Thread-safe.
    pub fn run_at<F>(&self, when: Instant, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timer_queue().add_timer(Box::new(callback), when, None)
    }

    /// Run `callback` once, `delay` from now. Thread-safe.
    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Run `callback` every `interval`, first firing one interval from now.
    /// Thread-safe.
    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timer_queue()
            .add_timer(Box::new(callback), Instant::now() + interval, Some(interval))
    }

    /// Cancel a scheduled timer. Thread-safe; honoured even while the
    /// timer's expiry batch is running.
    pub fn cancel(&self, id: TimerId) {
        self.timer_queue().cancel(id);
    }

    /// Unblock the poller. Thread-safe.
    pub fn wakeup(&self) {
        let n = sockets::write_eventfd(self.wakeup_fd);
        if n != 8 {
            error!("wakeup write returned {n} bytes instead of 8");
        }
        LOOP_WAKEUPS.increment();
    }

    /// Instant at which the current poll wait returned.
    pub fn poll_return_time(&self) -> Instant {
        *self.poll_return_time.lock()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            error!(
                owner = ?self.thread_id,
                current = ?thread::current().id(),
                "EventLoop used off its owning thread"
            );
            panic!("EventLoop used off its owning thread");
        }
    }

    pub(crate) fn timer_queue(&self) -> &TimerQueue {
        self.timers.get().expect("timer queue not initialized")
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        debug_assert!(std::ptr::eq(channel.owner_loop().as_ptr(), self));
        self.assert_in_loop_thread();
        self.poller.lock().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        debug_assert!(std::ptr::eq(channel.owner_loop().as_ptr(), self));
        self.assert_in_loop_thread();
        self.poller.lock().remove_channel(channel);
    }

    #[allow(dead_code)]
    pub(crate) fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        debug_assert!(std::ptr::eq(channel.owner_loop().as_ptr(), self));
        self.assert_in_loop_thread();
        self.poller.lock().has_channel(channel)
    }

    fn do_pending_tasks(&self) {
        self.calling_pending_tasks.store(true, Ordering::Release);
        // Swap the queue out under the lock; tasks enqueued by these tasks
        // land in the fresh vector and run next iteration.
        let tasks: Vec<Task> = std::mem::take(&mut *self.pending_tasks.lock());
        for task in tasks {
            task();
        }
        self.calling_pending_tasks.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        sockets::close(self.wakeup_fd);
        let _ = CURRENT_LOOP.try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if std::ptr::eq(slot.as_ptr(), self) {
                *slot = Weak::new();
            }
        });
    }
}
