use std::sync::Arc;

use bellows::{Config, EventLoop, TcpServer};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string())
        .parse()
        .expect("invalid listen address");

    let event_loop = EventLoop::new().expect("failed to create event loop");
    let server = TcpServer::with_config(
        &event_loop,
        bind_addr,
        "echo",
        Config {
            io_threads: 2,
            ..Config::default()
        },
    )
    .expect("failed to bind");

    server.set_connection_callback(Arc::new(|conn| {
        eprintln!(
            "{} -> {} is {}",
            conn.peer_addr(),
            conn.local_addr(),
            if conn.connected() { "up" } else { "down" }
        );
    }));
    server.set_message_callback(Arc::new(|conn, buf, _at| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
    }));

    eprintln!("echo server on {}", server.local_addr());
    server.start().expect("failed to start");
    event_loop.run();
}
