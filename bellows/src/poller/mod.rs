//! Readiness multiplexer abstraction.
//!
//! A poller waits for fd readiness and translates it back into channels.
//! The default backend is level-triggered epoll; the trait is the seam for
//! a poll(2)-based backend on platforms without it.

mod epoll;

use std::io;
use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::channel::Channel;

pub(crate) use epoll::EpollPoller;

/// Channel-side poller state: never seen by the backend.
pub(crate) const STATE_NEW: i8 = -1;
/// Registered in the kernel readiness set.
pub(crate) const STATE_ADDED: i8 = 1;
/// Known to the backend but detached (empty interest); kept in the fd map
/// so re-arming skips the insert.
pub(crate) const STATE_DELETED: i8 = 2;

pub(crate) trait Poller: Send {
    /// Wait up to `timeout_ms` for readiness, append every ready channel to
    /// `active` with its ready mask filled in, and return the wake time used
    /// as `receive_time` by downstream callbacks.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant;

    /// Propagate a channel's interest mask into the backend.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Forget a channel entirely. Its interest must already be empty.
    fn remove_channel(&mut self, channel: &Arc<Channel>);

    fn has_channel(&self, channel: &Arc<Channel>) -> bool;
}

/// Backend selector, decided once per loop at construction.
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    if std::env::var_os("BELLOWS_USE_POLL").is_some() {
        warn!("poll(2) backend is not compiled in, falling back to epoll");
    }
    Ok(Box::new(EpollPoller::new()?))
}
