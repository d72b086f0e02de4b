//! Per-connection state machine with buffered, non-blocking I/O.
//!
//! A connection is shared (`Arc`) between the server's table and any
//! in-flight task referencing it; every callback runs on the owning worker
//! loop, so user code observes strict serial order per connection. The
//! cross-thread surface is limited to `send`, `shutdown`, and the
//! configuration setters — everything else asserts loop-thread affinity.
//!
//! State machine:
//!
//! ```text
//! Connecting --connect_established--> Connected
//! Connected  --peer FIN / error-----> Disconnected
//! Connected  --shutdown()-----------> Disconnecting
//! Disconnecting --output drained----> shutdown_write, then peer FIN
//! ```

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACTIVE};
use crate::poller;
use crate::sockets::{self, Socket};

pub type TcpConnectionPtr = Arc<TcpConnection>;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    self_weak: Weak<TcpConnection>,
    loop_: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: &Arc<EventLoop>,
        name: String,
        sockfd: std::os::unix::io::RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let conn = Arc::new_cyclic(|self_weak: &Weak<TcpConnection>| {
            let socket = Socket::new(sockfd);
            if let Err(e) = socket.set_keep_alive(true) {
                warn!(name = %name, "SO_KEEPALIVE failed: {e}");
            }
            TcpConnection {
                self_weak: self_weak.clone(),
                loop_: event_loop.clone(),
                name,
                state: AtomicU8::new(State::Connecting as u8),
                socket,
                channel: Channel::new(event_loop, sockfd),
                local_addr,
                peer_addr,
                input_buffer: Mutex::new(Buffer::new()),
                output_buffer: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                callbacks: Mutex::new(Callbacks::default()),
                context: Mutex::new(None),
            }
        });
        debug!(name = %conn.name, fd = sockfd, "connection created");

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback(Box::new({
            let weak = weak.clone();
            move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(receive_time);
                }
            }
        }));
        conn.channel.set_write_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        }));
        conn.channel.set_close_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        }));
        conn.channel.set_error_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.loop_
    }

    /// Backpressure threshold on the output buffer, in bytes.
    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Relaxed);
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        if let Err(e) = self.socket.set_tcp_nodelay(on) {
            warn!(name = %self.name, "TCP_NODELAY failed: {e}");
        }
    }

    /// Attach an opaque per-connection value (e.g. a protocol context).
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock() = Some(context);
    }

    /// Borrow the opaque context slot for the duration of `f`.
    pub fn with_context<R>(&self, f: impl FnOnce(Option<&mut (dyn Any + Send)>) -> R) -> R {
        let mut slot = self.context.lock();
        f(slot.as_mut().map(|boxed| &mut **boxed))
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.lock().connection = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.lock().message = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(callback);
    }

    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback) {
        self.callbacks.lock().high_water_mark = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        self.callbacks.lock().close = Some(callback);
    }

    /// Send bytes to the peer. Thread-safe: off the owning loop the payload
    /// is copied once into a refcounted buffer and forwarded through the
    /// task queue.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let payload = Bytes::copy_from_slice(data);
            let conn = self.me();
            self.loop_.run_in_loop(move || conn.send_in_loop(&payload));
        }
    }

    /// Send the readable contents of `buf`, draining it.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(buf.peek());
            buf.retrieve_all();
        } else {
            let payload = Bytes::from(buf.retrieve_all_as_bytes());
            let conn = self.me();
            self.loop_.run_in_loop(move || conn.send_in_loop(&payload));
        }
    }

    /// Close the write half once buffered output drains. Thread-safe.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = self.me();
            self.loop_.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Final step of server-side establishment; runs on the owning loop.
    pub(crate) fn connect_established(&self) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        CONNECTIONS_ACTIVE.increment();

        let me = self.me();
        let owner: Arc<dyn Any + Send + Sync> = me.clone();
        self.channel.tie(&owner);
        self.channel.enable_reading();

        if let Some(cb) = self.connection_callback() {
            cb(&me);
        }
    }

    /// Idempotent teardown; always the last thing to run on the owning
    /// loop for this connection.
    pub(crate) fn connect_destroyed(&self) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            CONNECTIONS_ACTIVE.decrement();
            self.channel.disable_all();
            if let Some(cb) = self.connection_callback() {
                cb(&self.me());
            }
        }
        if self.channel.index() != poller::STATE_NEW {
            self.channel.remove();
        }
    }

    fn me(&self) -> TcpConnectionPtr {
        self.self_weak.upgrade().expect("connection not shared")
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn connection_callback(&self) -> Option<ConnectionCallback> {
        self.callbacks.lock().connection.clone()
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!(name = %self.name, "disconnected, give up writing");
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        // Nothing queued and no write interest: try the direct write.
        if !self.channel.is_writing() && self.output_buffer.lock().readable_bytes() == 0 {
            match sockets::write(self.channel.fd(), data) {
                Ok(n) => {
                    BYTES_SENT.add(n as u64);
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        let write_complete_cb = self.callbacks.lock().write_complete.clone();
                        if let Some(cb) = write_complete_cb {
                            let conn = self.me();
                            self.loop_.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        error!(name = %self.name, "write failed: {e}");
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            // The next poll will report the hangup; don't
                            // queue bytes the peer can never read.
                            fault = true;
                        }
                    }
                }
            }
        }

        debug_assert!(remaining <= data.len());
        if !fault && remaining > 0 {
            let mut output = self.output_buffer.lock();
            let old_len = output.readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                let high_water_cb = self.callbacks.lock().high_water_mark.clone();
                if let Some(cb) = high_water_cb {
                    let conn = self.me();
                    let queued = old_len + remaining;
                    self.loop_.queue_in_loop(move || cb(&conn, queued));
                }
            }
            output.append(&data[nwrote..]);
            drop(output);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        // Still flushing: handle_write performs the shutdown once the
        // output buffer drains.
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                error!(name = %self.name, "shutdown failed: {e}");
            }
        }
    }

    fn handle_read(&self, receive_time: Instant) {
        self.loop_.assert_in_loop_thread();
        let mut input = self.input_buffer.lock();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                BYTES_RECEIVED.add(n as u64);
                // Clone the callback out so its slot is unlocked while user
                // code runs (the callback may well call send()).
                let message_cb = self.callbacks.lock().message.clone();
                match message_cb {
                    Some(cb) => cb(&self.me(), &mut input, receive_time),
                    None => input.retrieve_all(),
                }
            }
            Err(e) => {
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                ) {
                    return;
                }
                drop(input);
                error!(name = %self.name, "read failed: {e}");
                self.handle_error();
                self.handle_close();
            }
        }
    }

    fn handle_write(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(fd = self.channel.fd(), "connection is down, no more writing");
            return;
        }
        let mut output = self.output_buffer.lock();
        match sockets::write(self.channel.fd(), output.peek()) {
            Ok(n) => {
                BYTES_SENT.add(n as u64);
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    // Interest must drop with the buffer empty, or a
                    // level-triggered poller reports writability forever.
                    self.channel.disable_writing();
                    let write_complete_cb = self.callbacks.lock().write_complete.clone();
                    if let Some(cb) = write_complete_cb {
                        let conn = self.me();
                        self.loop_.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                } else {
                    trace!(name = %self.name, "output buffer not yet drained");
                }
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::WouldBlock {
                    error!(name = %self.name, "write failed: {e}");
                }
            }
        }
    }

    fn handle_close(&self) {
        self.loop_.assert_in_loop_thread();
        let state = self.state();
        if state != State::Connected && state != State::Disconnecting {
            return;
        }
        trace!(fd = self.channel.fd(), ?state, "closing");
        self.set_state(State::Disconnected);
        CONNECTIONS_ACTIVE.decrement();
        self.channel.disable_all();

        let (connection_cb, close_cb) = {
            let cbs = self.callbacks.lock();
            (cbs.connection.clone(), cbs.close.clone())
        };
        let guard = self.me();
        if let Some(cb) = connection_cb {
            cb(&guard);
        }
        // Must be last: hands the connection back to the server for
        // removal from its table.
        if let Some(cb) = close_cb {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        let err = sockets::socket_error(self.channel.fd());
        error!(
            name = %self.name,
            "connection error, SO_ERROR = {} ({})",
            err,
            std::io::Error::from_raw_os_error(err)
        );
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, "connection dropped");
    }
}

/// Default connection callback: log the transition.
pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Default message callback: discard the bytes.
pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _at: Instant) {
    buf.retrieve_all();
}
