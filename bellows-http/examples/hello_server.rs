use std::sync::Arc;

use bellows::EventLoop;
use bellows_http::{HttpServer, StatusCode};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8000".to_string())
        .parse()
        .expect("invalid listen address");

    let event_loop = EventLoop::new().expect("failed to create event loop");
    let server = HttpServer::bind(&event_loop, bind_addr, "hello").expect("failed to bind");
    server.set_thread_num(2);
    server.set_http_callback(Arc::new(|request, response| {
        match request.path() {
            "/" | "/hello" => {
                response.set_status_code(StatusCode::Ok);
                response.set_status_message("OK");
                response.set_content_type("text/plain");
                response.set_body("hello");
            }
            _ => {
                response.set_status_code(StatusCode::NotFound);
                response.set_status_message("Not Found");
                response.set_close_connection(true);
            }
        }
    }));

    eprintln!("http server on {}", server.local_addr());
    server.start().expect("failed to start");
    event_loop.run();
}
