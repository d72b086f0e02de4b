//! Level-triggered epoll backend.
//!
//! Level-triggered means a still-ready fd is reported again on the next
//! wait; handlers must either consume the readiness or drop the interest
//! bit, or the loop will spin.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, trace};

use crate::channel::Channel;
use crate::poller::{Poller, STATE_ADDED, STATE_DELETED, STATE_NEW};
use crate::sockets;

const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct EpollPoller {
    epoll_fd: RawFd,
    /// Reused kernel-facing ready array; doubles when a wait fills it.
    events: Vec<libc::epoll_event>,
    /// Every channel in state Added or Deleted, keyed by fd.
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epoll_fd,
            events: vec![unsafe { mem::zeroed() }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    fn fill_active_channels(&self, num_events: usize, active: &mut Vec<Arc<Channel>>) {
        debug_assert!(num_events <= self.events.len());
        for i in 0..num_events {
            let event = self.events[i];
            let fd = event.u64 as RawFd;
            match self.channels.get(&fd) {
                Some(channel) => {
                    channel.set_revents(event.events);
                    active.push(channel.clone());
                }
                None => {
                    // A channel removed by an earlier handler in this batch
                    // can still have a stale kernel entry.
                    trace!(fd, "ready event for unknown fd");
                }
            }
        }
    }

    fn update(&self, op: libc::c_int, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };
        trace!(fd, op = op_name(op), events = channel.events(), "epoll_ctl");
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!(fd, "epoll_ctl DEL failed: {err}");
            } else {
                // ADD/MOD failure means the fd map and the kernel set have
                // diverged; nothing sensible can continue.
                panic!("epoll_ctl {} on fd {fd} failed: {err}", op_name(op));
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        trace!(total = self.channels.len(), "polling");
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Instant::now();

        if num_events > 0 {
            let num_events = num_events as usize;
            trace!(num_events, "events happened");
            self.fill_active_channels(num_events, active);
            if num_events == self.events.len() {
                let doubled = self.events.len() * 2;
                self.events.resize(doubled, unsafe { mem::zeroed() });
            }
        } else if num_events == 0 {
            trace!("nothing happened");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!("epoll_wait failed: {saved}");
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        let fd = channel.fd();
        if index == STATE_NEW || index == STATE_DELETED {
            if index == STATE_NEW {
                assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                assert!(self.has_channel(channel));
            }
            channel.set_index(STATE_ADDED);
            self.update(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(self.has_channel(channel));
            assert_eq!(index, STATE_ADDED);
            if channel.is_none_event() {
                self.update(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(STATE_DELETED);
            } else {
                self.update(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        assert!(self.has_channel(channel));
        assert!(channel.is_none_event());
        let index = channel.index();
        assert!(index == STATE_ADDED || index == STATE_DELETED);
        self.channels.remove(&fd);
        if index == STATE_ADDED {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(STATE_NEW);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|found| Arc::ptr_eq(found, channel))
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        sockets::close(self.epoll_fd);
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_MOD => "MOD",
        libc::EPOLL_CTL_DEL => "DEL",
        _ => "???",
    }
}
