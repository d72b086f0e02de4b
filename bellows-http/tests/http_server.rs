//! End-to-end HTTP scenarios over real sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use bellows::EventLoop;
use bellows_http::{HttpCallback, HttpServer, Method, StatusCode, Version};

fn run_http_server(
    callback: HttpCallback,
) -> (SocketAddr, Arc<EventLoop>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server =
            HttpServer::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), "http-test").unwrap();
        server.set_http_callback(callback);
        server.start().unwrap();
        tx.send((event_loop.clone(), server.local_addr())).unwrap();
        event_loop.run();
    });
    let (event_loop, addr) = rx.recv().unwrap();
    (addr, event_loop, handle)
}

fn stop_server(event_loop: Arc<EventLoop>, handle: thread::JoinHandle<()>) {
    event_loop.quit();
    handle.join().unwrap();
}

fn hello_callback() -> HttpCallback {
    Arc::new(|_request, response| {
        response.set_status_code(StatusCode::Ok);
        response.set_status_message("OK");
        response.set_body("hello");
    })
}

#[test]
fn test_bad_request_line_gets_400_and_close() {
    let (addr, event_loop, handle) = run_http_server(hello_callback());

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"GET\r\n\r\n").unwrap();

    // Server answers 400 and shuts its write half; read_to_end sees the
    // response then EOF.
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    assert!(
        reply.starts_with(b"HTTP/1.1 400 Bad Request\r\n\r\n"),
        "unexpected reply: {:?}",
        String::from_utf8_lossy(&reply)
    );

    drop(client);
    stop_server(event_loop, handle);
}

#[test]
fn test_request_roundtrip_literal_bytes() {
    // Capture what the callback observed; asserting inside the loop thread
    // would only kill that thread.
    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    let callback: HttpCallback = Arc::new(move |request, response| {
        *s.lock().unwrap() = Some((
            request.method(),
            request.path().to_string(),
            request.version(),
            request.header("Host").map(str::to_string),
        ));
        response.set_status_code(StatusCode::Ok);
        response.set_status_message("OK");
        response.set_body("hello");
    });
    let (addr, event_loop, handle) = run_http_server(callback);

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    let mut reply = vec![0u8; expected.len()];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply, expected);

    let seen = seen.lock().unwrap().take().expect("callback never ran");
    assert_eq!(seen.0, Some(Method::Get));
    assert_eq!(seen.1, "/hello");
    assert_eq!(seen.2, Version::Http11);
    assert_eq!(seen.3.as_deref(), Some("x"));

    drop(client);
    stop_server(event_loop, handle);
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let (addr, event_loop, handle) = run_http_server(hello_callback());

    let mut client = TcpStream::connect(addr).unwrap();
    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    for _ in 0..3 {
        client
            .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let mut reply = vec![0u8; expected.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, expected);
    }

    drop(client);
    stop_server(event_loop, handle);
}

#[test]
fn test_connection_close_header_closes() {
    let (addr, event_loop, handle) = run_http_server(hello_callback());

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    assert!(
        reply.starts_with(b"HTTP/1.1 200 OK\r\nConnection: close\r\n"),
        "unexpected reply: {:?}",
        String::from_utf8_lossy(&reply)
    );
    assert!(reply.ends_with(b"\r\nhello"));

    drop(client);
    stop_server(event_loop, handle);
}

#[test]
fn test_http10_without_keep_alive_closes() {
    let (addr, event_loop, handle) = run_http_server(hello_callback());

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"GET /hello HTTP/1.0\r\n\r\n").unwrap();

    // EOF proves the server chose to close.
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\nConnection: close\r\n"));

    drop(client);
    stop_server(event_loop, handle);
}
