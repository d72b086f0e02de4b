/// Configuration for a [`TcpServer`](crate::TcpServer).
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of I/O worker threads. 0 means all connections are served on
    /// the acceptor loop itself.
    pub io_threads: usize,
    /// Default output-buffer high watermark per connection, in bytes.
    /// Crossing it from below fires the high-watermark callback once.
    pub high_water_mark: usize,
    /// Enable TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            io_threads: 0,
            high_water_mark: 64 * 1024 * 1024,
            tcp_nodelay: false,
        }
    }
}
