//! HTTP server assembled from a [`TcpServer`].
//!
//! Each new connection gets an [`HttpContext`] in its opaque context slot;
//! message events feed the parser, a malformed request draws a 400 and a
//! half-close, and a complete request is handed to the user callback as a
//! (request, response-builder) pair.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::info;

use bellows::buffer::Buffer;
use bellows::error::Error;
use bellows::event_loop::EventLoop;
use bellows::tcp_connection::TcpConnectionPtr;
use bellows::{Config, TcpServer};

use crate::context::HttpContext;
use crate::request::{HttpRequest, Version};
use crate::response::HttpResponse;

pub type HttpCallback = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

pub struct HttpServer {
    server: Arc<TcpServer>,
    http_callback: Mutex<HttpCallback>,
}

/// Without a user callback every request 404s and closes.
fn default_http_callback(_request: &HttpRequest, response: &mut HttpResponse) {
    response.set_status_message("Not Found");
    response.set_close_connection(true);
}

impl HttpServer {
    pub fn bind(
        event_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: &str,
    ) -> Result<Arc<HttpServer>, Error> {
        Self::with_config(event_loop, listen_addr, name, Config::default())
    }

    pub fn with_config(
        event_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: &str,
        config: Config,
    ) -> Result<Arc<HttpServer>, Error> {
        let server = TcpServer::with_config(event_loop, listen_addr, name, config)?;
        let http_server = Arc::new(HttpServer {
            server,
            http_callback: Mutex::new(Arc::new(default_http_callback)),
        });

        http_server
            .server
            .set_connection_callback(Arc::new(|conn| {
                if conn.connected() {
                    conn.set_context(Box::new(HttpContext::new()));
                }
            }));
        let weak = Arc::downgrade(&http_server);
        http_server
            .server
            .set_message_callback(Arc::new(move |conn, buf, receive_time| {
                if let Some(http_server) = weak.upgrade() {
                    http_server.on_message(conn, buf, receive_time);
                }
            }));
        Ok(http_server)
    }

    pub fn set_http_callback(&self, callback: HttpCallback) {
        *self.http_callback.lock() = callback;
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.server.set_thread_num(num_threads);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn start(&self) -> Result<(), Error> {
        info!(
            name = self.server.name(),
            addr = self.server.host_port(),
            "HTTP server starting"
        );
        self.server.start()
    }

    fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, receive_time: Instant) {
        let mut bad_request = false;
        let mut completed: Option<HttpRequest> = None;

        conn.with_context(|context| {
            let Some(context) = context.and_then(|c| c.downcast_mut::<HttpContext>()) else {
                return;
            };
            if !context.parse(buf, receive_time) {
                bad_request = true;
                return;
            }
            if context.got_all() {
                completed = Some(context.take_request());
            }
        });

        if bad_request {
            conn.send(b"HTTP/1.1 400 Bad Request\r\n\r\n");
            conn.shutdown();
            return;
        }
        if let Some(request) = completed {
            self.on_request(conn, &request);
        }
    }

    fn on_request(&self, conn: &TcpConnectionPtr, request: &HttpRequest) {
        let connection_header = request.header("Connection");
        let close = connection_header == Some("close")
            || (request.version() == Version::Http10 && connection_header != Some("Keep-Alive"));

        let mut response = HttpResponse::new(close);
        (self.http_callback.lock().clone())(request, &mut response);

        let mut out = Buffer::new();
        response.append_to_buffer(&mut out);
        conn.send_buffer(&mut out);
        if response.close_connection() {
            conn.shutdown();
        }
    }
}
