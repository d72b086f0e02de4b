//! Wires the acceptor, the worker pool, and the connection lifecycle into
//! a serving entity.
//!
//! The connection table lives on the acceptor loop: insertions happen in
//! the accept path, removals are posted back to it by each connection's
//! close handler, and the final teardown is posted onward to the
//! connection's worker loop. That ping-pong keeps the table single-writer
//! while guaranteeing a connection's last callback runs on its own loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::acceptor::Acceptor;
use crate::config::Config;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::sockets;
use crate::tcp_connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::thread_pool::{EventLoopThreadPool, ThreadInitCallback};

pub struct TcpServer {
    self_weak: Weak<TcpServer>,
    loop_: Arc<EventLoop>,
    name: String,
    host_port: String,
    local_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    pool: EventLoopThreadPool,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    config: Config,
}

impl TcpServer {
    /// Bind `listen_addr` on `event_loop` (the acceptor loop) with default
    /// configuration. The socket listens only once [`start`](Self::start)
    /// runs.
    pub fn bind(
        event_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: &str,
    ) -> Result<Arc<TcpServer>, Error> {
        Self::with_config(event_loop, listen_addr, name, Config::default())
    }

    pub fn with_config(
        event_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: &str,
        config: Config,
    ) -> Result<Arc<TcpServer>, Error> {
        let acceptor = Acceptor::new(event_loop, &listen_addr)?;
        // Read the address back: binding port 0 picks an ephemeral port.
        let local_addr = sockets::local_addr(acceptor.fd())?;

        let server = Arc::new_cyclic(|self_weak: &Weak<TcpServer>| TcpServer {
            self_weak: self_weak.clone(),
            loop_: event_loop.clone(),
            name: name.to_string(),
            host_port: local_addr.to_string(),
            local_addr,
            acceptor,
            pool: EventLoopThreadPool::new(event_loop.clone(), name),
            connection_callback: Mutex::new(Arc::new(default_connection_callback)),
            message_callback: Mutex::new(Arc::new(default_message_callback)),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
            config,
        });
        server.pool.set_thread_num(server.config.io_threads);

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |sockfd, peer_addr| {
                match weak.upgrade() {
                    Some(server) => server.new_connection(sockfd, peer_addr),
                    None => sockets::close(sockfd),
                }
            }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    /// The bound listen address (with the real port when 0 was requested).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of I/O worker loops; overrides the config value. Must be
    /// called before [`start`](Self::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock() = callback;
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock() = callback;
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock() = Some(callback);
    }

    pub fn set_thread_init_callback(&self, callback: ThreadInitCallback) {
        *self.thread_init_callback.lock() = Some(callback);
    }

    /// Start the worker pool and post `listen` to the acceptor loop.
    /// Idempotent; call from the acceptor loop's thread.
    pub fn start(&self) -> Result<(), Error> {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.pool.start(self.thread_init_callback.lock().clone())?;
            assert!(!self.acceptor.listening());
            info!(name = %self.name, addr = %self.host_port, "server listening");
            let acceptor = self.acceptor.clone();
            self.loop_.run_in_loop(move || acceptor.listen());
        }
        Ok(())
    }

    /// Accept-path continuation; runs on the acceptor loop.
    fn new_connection(&self, sockfd: RawFd, peer_addr: SocketAddr) {
        self.loop_.assert_in_loop_thread();
        let io_loop = self.pool.next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}:{}#{}", self.name, self.host_port, conn_id);
        debug!(name = %conn_name, peer = %peer_addr, "new connection");

        let local_addr = match sockets::local_addr(sockfd) {
            Ok(addr) => addr,
            Err(e) => {
                error!("getsockname failed: {e}");
                sockets::close(sockfd);
                return;
            }
        };

        let conn = TcpConnection::new(&io_loop, conn_name.clone(), sockfd, local_addr, peer_addr);
        if self.config.tcp_nodelay {
            conn.set_tcp_nodelay(true);
        }
        conn.set_high_water_mark(self.config.high_water_mark);
        conn.set_connection_callback(self.connection_callback.lock().clone());
        conn.set_message_callback(self.message_callback.lock().clone());
        if let Some(cb) = self.write_complete_callback.lock().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = self.self_weak.clone();
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections.lock().insert(conn_name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Close-handler continuation; may run on any worker loop, so it posts
    /// the table mutation to the acceptor loop.
    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        let server = self.self_weak.upgrade().expect("server not shared");
        let conn = conn.clone();
        self.loop_
            .run_in_loop(move || server.remove_connection_in_loop(conn));
    }

    fn remove_connection_in_loop(&self, conn: TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        debug!(name = conn.name(), "removing connection");
        let removed = self.connections.lock().remove(conn.name());
        debug_assert!(removed.is_some());
        let io_loop = conn.owner_loop().clone();
        // queue, not run: the final teardown must happen in a later task
        // drain, after any in-flight references settle.
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        for (_, conn) in self.connections.lock().drain() {
            let io_loop = conn.owner_loop().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
        let acceptor = self.acceptor.clone();
        self.loop_.run_in_loop(move || acceptor.deregister());
    }
}
