//! Channel: the binding of one file descriptor to interest/ready event
//! masks and a set of dispatch callbacks on one event loop.
//!
//! A channel never owns its fd. The owner registers interest through
//! `enable_*`/`disable_*` (each mutation is pushed into the owning loop's
//! poller) and must call `disable_all` followed by `remove` before letting
//! the channel go.

use std::any::Any;
use std::fmt::Write as _;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::event_loop::EventLoop;
use crate::poller;

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

const HUP: u32 = libc::EPOLLHUP as u32;
const ERR: u32 = libc::EPOLLERR as u32;
const PRI: u32 = libc::EPOLLPRI as u32;
const IN: u32 = libc::EPOLLIN as u32;
const OUT: u32 = libc::EPOLLOUT as u32;
const RDHUP: u32 = libc::EPOLLRDHUP as u32;
/// poll(2)'s POLLNVAL. The epoll backend never reports it; a poll-based
/// backend would.
const INVALID: u32 = 0x20;

pub(crate) type ReadEventCallback = Box<dyn FnMut(Instant) + Send>;
pub(crate) type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Callbacks {
    read: Option<ReadEventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

pub struct Channel {
    self_weak: Weak<Channel>,
    loop_: Weak<EventLoop>,
    fd: RawFd,
    /// Interest mask, fed to the poller.
    events: AtomicU32,
    /// Ready mask, written by the poller before dispatch.
    revents: AtomicU32,
    /// Poller bookkeeping state, one of the `poller::STATE_*` values.
    index: AtomicI8,
    tied: AtomicBool,
    event_handling: AtomicBool,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    pub(crate) fn new(event_loop: &Arc<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_weak| Channel {
            self_weak: self_weak.clone(),
            loop_: Arc::downgrade(event_loop),
            fd,
            events: AtomicU32::new(NONE_EVENT),
            revents: AtomicU32::new(NONE_EVENT),
            index: AtomicI8::new(poller::STATE_NEW),
            tied: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            tie: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> u32 {
        self.events.load(Ordering::Relaxed)
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    pub(crate) fn index(&self) -> i8 {
        self.index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index(&self, index: i8) {
        self.index.store(index, Ordering::Relaxed);
    }

    pub(crate) fn owner_loop(&self) -> &Weak<EventLoop> {
        &self.loop_
    }

    pub(crate) fn set_read_callback(&self, cb: ReadEventCallback) {
        self.callbacks.lock().read = Some(cb);
    }

    pub(crate) fn set_write_callback(&self, cb: EventCallback) {
        self.callbacks.lock().write = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: EventCallback) {
        self.callbacks.lock().close = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: EventCallback) {
        self.callbacks.lock().error = Some(cb);
    }

    /// Tie dispatch to `owner`'s liveness: if the weak reference cannot be
    /// upgraded at dispatch time the events are dropped, defending against
    /// an owner destroyed while its fd is still in the ready list.
    pub(crate) fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(Arc::downgrade(owner));
        self.tied.store(true, Ordering::Release);
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.events() == NONE_EVENT
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.events() & WRITE_EVENT != 0
    }

    #[allow(dead_code)]
    pub(crate) fn is_reading(&self) -> bool {
        self.events() & READ_EVENT != 0
    }

    pub(crate) fn enable_reading(&self) {
        self.events.fetch_or(READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    #[allow(dead_code)]
    pub(crate) fn disable_reading(&self) {
        self.events.fetch_and(!READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn enable_writing(&self) {
        self.events.fetch_or(WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_writing(&self) {
        self.events.fetch_and(!WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_all(&self) {
        self.events.store(NONE_EVENT, Ordering::Relaxed);
        self.update();
    }

    fn update(&self) {
        let me = self.self_weak.upgrade().expect("channel not shared");
        let event_loop = self.loop_.upgrade().expect("channel outlived its loop");
        event_loop.update_channel(&me);
    }

    /// Detach from the poller. Interest must already be empty.
    pub(crate) fn remove(&self) {
        assert!(self.is_none_event());
        let me = self.self_weak.upgrade().expect("channel not shared");
        let event_loop = self.loop_.upgrade().expect("channel outlived its loop");
        event_loop.remove_channel(&me);
    }

    pub(crate) fn handle_event(&self, receive_time: Instant) {
        if self.tied.load(Ordering::Acquire) {
            let tie = self.tie.lock().clone();
            let guard = tie.and_then(|weak| weak.upgrade());
            if guard.is_some() {
                self.handle_event_guarded(receive_time);
            } else {
                trace!(fd = self.fd, "channel owner gone, dropping events");
            }
        } else {
            self.handle_event_guarded(receive_time);
        }
    }

    fn handle_event_guarded(&self, receive_time: Instant) {
        self.event_handling.store(true, Ordering::Relaxed);
        let revents = self.revents.load(Ordering::Relaxed);
        let mut cbs = self.callbacks.lock();

        if (revents & HUP != 0) && (revents & IN == 0) {
            warn!(fd = self.fd, "peer hung up");
            if let Some(cb) = cbs.close.as_mut() {
                cb();
            }
        }
        if revents & INVALID != 0 {
            warn!(fd = self.fd, "invalid fd reported by poller");
        }
        if revents & (ERR | INVALID) != 0 {
            if let Some(cb) = cbs.error.as_mut() {
                cb();
            }
        }
        if revents & (IN | PRI | RDHUP) != 0 {
            if let Some(cb) = cbs.read.as_mut() {
                cb(receive_time);
            }
        }
        if revents & OUT != 0 {
            if let Some(cb) = cbs.write.as_mut() {
                cb();
            }
        }

        self.event_handling.store(false, Ordering::Relaxed);
    }

    /// Human-readable ready mask, for trace logging.
    pub(crate) fn revents_to_string(&self) -> String {
        let revents = self.revents.load(Ordering::Relaxed);
        let mut out = format!("{}:", self.fd);
        for (bit, name) in [
            (IN, " IN"),
            (PRI, " PRI"),
            (OUT, " OUT"),
            (HUP, " HUP"),
            (RDHUP, " RDHUP"),
            (ERR, " ERR"),
            (INVALID, " NVAL"),
        ] {
            if revents & bit != 0 {
                let _ = out.write_str(name);
            }
        }
        out
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.load(Ordering::Relaxed));
    }
}
