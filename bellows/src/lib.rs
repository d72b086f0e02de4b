//! bellows - a single-process, multi-reactor TCP networking library.
//!
//! One acceptor event loop plus a round-robin pool of I/O worker loops,
//! each a level-triggered epoll reactor with an eventfd self-wakeup and a
//! timerfd timer queue. Connections carry application-level input/output
//! buffers with non-blocking sends, backpressure watermarks, and half-close
//! semantics.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bellows::{EventLoop, TcpServer};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let server = TcpServer::bind(&event_loop, "127.0.0.1:7878".parse().unwrap(), "echo").unwrap();
//! server.set_message_callback(Arc::new(|conn, buf, _at| {
//!     let msg = buf.retrieve_all_as_string();
//!     conn.send(msg.as_bytes());
//! }));
//! server.start().unwrap();
//! event_loop.run();
//! ```

pub(crate) mod acceptor;
pub mod buffer;
pub(crate) mod channel;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod metrics;
pub(crate) mod poller;
pub(crate) mod sockets;
pub mod tcp_connection;
pub mod tcp_server;
pub mod thread_pool;
pub mod timer;
pub(crate) mod timer_queue;

// Public API re-exports
pub use buffer::Buffer;
pub use config::Config;
pub use error::Error;
pub use event_loop::EventLoop;
pub use tcp_connection::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use tcp_server::TcpServer;
pub use thread_pool::{EventLoopThreadPool, ThreadInitCallback};
pub use timer::TimerId;
