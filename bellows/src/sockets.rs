//! Platform shim: thin wrappers over the socket, epoll-adjacent fd, and
//! byte-order syscalls the reactor is built on.
//!
//! Everything here is a direct translation of one syscall plus errno
//! handling; policy lives in the callers.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::sync::Once;
use std::time::{Duration, Instant};

/// Ignore SIGPIPE once per process, so writing to a half-closed peer
/// surfaces as EPIPE instead of killing us.
pub(crate) fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// Create a non-blocking, close-on-exec TCP socket for `addr`'s family.
pub(crate) fn create_nonblocking(addr: &SocketAddr) -> io::Result<RawFd> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = to_sockaddr(addr);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::listen(fd, libc::SOMAXCONN) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accept one pending connection, non-blocking and close-on-exec atomically.
pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let connfd = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if connfd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((connfd, from_sockaddr(&storage)))
}

pub(crate) fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub(crate) fn readv(fd: RawFd, iov: &mut [libc::iovec]) -> io::Result<usize> {
    let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iov.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let optval: libc::c_int = on as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub(crate) fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

pub(crate) fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

/// Fetch and clear the pending SO_ERROR on a socket.
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        optval
    }
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(from_sockaddr(&storage))
}

/// Create the 8-byte counter fd used for cross-thread loop wakeups.
pub(crate) fn create_eventfd() -> io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Write one tick into an eventfd counter. Returns bytes written.
pub(crate) fn write_eventfd(fd: RawFd) -> isize {
    let one: u64 = 1;
    unsafe { libc::write(fd, &one as *const u64 as *const libc::c_void, 8) }
}

/// Read and clear an eventfd counter. Returns bytes read.
pub(crate) fn read_eventfd(fd: RawFd) -> isize {
    let mut count: u64 = 0;
    unsafe { libc::read(fd, &mut count as *mut u64 as *mut libc::c_void, 8) }
}

/// Create a monotonic, non-blocking, close-on-exec timer fd.
pub(crate) fn create_timerfd() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Arm `timerfd` to fire at `expiration`.
///
/// The relative delay is floored at 100 microseconds: a zero itimerspec
/// disarms the timer instead of firing it.
pub(crate) fn arm_timerfd(timerfd: RawFd, expiration: Instant) -> io::Result<()> {
    let delay = expiration
        .saturating_duration_since(Instant::now())
        .max(Duration::from_micros(100));
    let mut new_value: libc::itimerspec = unsafe { mem::zeroed() };
    new_value.it_value.tv_sec = delay.as_secs() as libc::time_t;
    new_value.it_value.tv_nsec = delay.subsec_nanos() as libc::c_long;
    let ret = unsafe { libc::timerfd_settime(timerfd, 0, &new_value, std::ptr::null_mut()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read a timer fd, clearing its readability. Returns the fire count.
pub(crate) fn read_timerfd(timerfd: RawFd) -> io::Result<u64> {
    let mut howmany: u64 = 0;
    let n = unsafe { libc::read(timerfd, &mut howmany as *mut u64 as *mut libc::c_void, 8) };
    if n != 8 {
        return Err(io::Error::last_os_error());
    }
    Ok(howmany)
}

pub(crate) fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

pub(crate) fn from_sockaddr(storage: &libc::sockaddr_storage) -> SocketAddr {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
                u16::from_be(sa.sin_port),
            ))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sa.sin6_addr.s6_addr),
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            ))
        }
        family => unreachable!("unsupported address family {family}"),
    }
}

/// Owns a connected or listening socket fd and closes it on drop.
pub(crate) struct Socket {
    fd: RawFd,
}

impl Socket {
    pub(crate) fn new(fd: RawFd) -> Self {
        Socket { fd }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        bind(self.fd, addr)
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        listen(self.fd)
    }

    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        shutdown_write(self.fd)
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_reuse_addr(self.fd, on)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        set_keep_alive(self.fd, on)
    }

    pub(crate) fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        set_tcp_nodelay(self.fd, on)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        close(self.fd);
    }
}
