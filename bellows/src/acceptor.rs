//! Listening-socket handler.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::metrics::CONNECTIONS_ACCEPTED;
use crate::sockets::{self, Socket};

pub(crate) type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr) + Send>;

/// Accepts inbound connections on one listening socket and hands the fds
/// to a callback.
///
/// Keeps an idle fd open on `/dev/null` as an escape hatch for EMFILE:
/// when the process fd table is full, the reserve is closed, the pending
/// connection is accepted and immediately dropped (draining the readiness
/// so a level-triggered poller does not spin), and the reserve is
/// reopened.
pub(crate) struct Acceptor {
    loop_: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    idle_fd: Mutex<RawFd>,
    listening: AtomicBool,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub(crate) fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
    ) -> Result<Arc<Acceptor>, Error> {
        let socket = Socket::new(sockets::create_nonblocking(listen_addr)?);
        socket.set_reuse_addr(true)?;
        socket.bind(listen_addr)?;
        let idle_fd = open_idle_fd()?;
        let channel = Channel::new(event_loop, socket.fd());

        let acceptor = Arc::new(Acceptor {
            loop_: event_loop.clone(),
            socket,
            channel,
            idle_fd: Mutex::new(idle_fd),
            listening: AtomicBool::new(false),
            new_connection_callback: Mutex::new(None),
        });
        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(Box::new(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));
        Ok(acceptor)
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    pub(crate) fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.new_connection_callback.lock() = Some(callback);
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub(crate) fn listen(&self) {
        self.loop_.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        if let Err(e) = self.socket.listen() {
            error!(fd = self.socket.fd(), "listen failed: {e}");
            panic!("listen failed: {e}");
        }
        self.channel.enable_reading();
    }

    /// Detach from the poller so the fd slot can be reused. Loop thread
    /// only; called from the owning server's teardown.
    pub(crate) fn deregister(&self) {
        self.loop_.assert_in_loop_thread();
        if self.listening.swap(false, Ordering::AcqRel) {
            self.channel.disable_all();
            self.channel.remove();
        }
    }

    fn handle_read(&self) {
        self.loop_.assert_in_loop_thread();
        match sockets::accept(self.socket.fd()) {
            Ok((connfd, peer_addr)) => {
                CONNECTIONS_ACCEPTED.increment();
                let mut callback = self.new_connection_callback.lock();
                match callback.as_mut() {
                    Some(callback) => callback(connfd, peer_addr),
                    None => sockets::close(connfd),
                }
            }
            Err(e) => match e.raw_os_error() {
                Some(libc::EMFILE) => {
                    warn!("fd table exhausted, shedding one connection");
                    let mut idle = self.idle_fd.lock();
                    sockets::close(*idle);
                    *idle = unsafe {
                        libc::accept(
                            self.socket.fd(),
                            std::ptr::null_mut(),
                            std::ptr::null_mut(),
                        )
                    };
                    sockets::close(*idle);
                    *idle = open_idle_fd().expect("reopen /dev/null");
                }
                // Transient conditions on a non-blocking listener.
                Some(libc::EAGAIN)
                | Some(libc::ECONNABORTED)
                | Some(libc::EINTR)
                | Some(libc::EPROTO)
                | Some(libc::EPERM) => {}
                _ => error!("accept failed: {e}"),
            },
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        sockets::close(*self.idle_fd.lock());
    }
}

fn open_idle_fd() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}
