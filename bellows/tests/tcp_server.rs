//! End-to-end server scenarios over real sockets on 127.0.0.1.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bellows::{Config, EventLoop, TcpServer};

/// Start a server with `setup` applied, on its own acceptor-loop thread.
/// Returns the bound address, the acceptor loop, and the join handle.
fn run_server<F>(
    config: Config,
    setup: F,
) -> (SocketAddr, Arc<EventLoop>, thread::JoinHandle<()>)
where
    F: FnOnce(&Arc<TcpServer>) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::with_config(
            &event_loop,
            "127.0.0.1:0".parse().unwrap(),
            "test",
            config,
        )
        .unwrap();
        setup(&server);
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

fn echo_setup(server: &Arc<TcpServer>) {
    server.set_message_callback(Arc::new(|conn, buf, _at| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
    }));
}

#[test]
fn test_echo_single_message() {
    let (addr, event_loop, handle) = run_server(Config::default(), echo_setup);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello\n").unwrap();
    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\n");

    drop(client);
    stop_server(event_loop, handle);
}

#[test]
fn test_echo_on_worker_pool() {
    let config = Config {
        io_threads: 3,
        ..Config::default()
    };
    let (addr, event_loop, handle) = run_server(config, echo_setup);

    // Several concurrent clients land round-robin on different workers.
    let mut clients = Vec::new();
    for i in 0..6u8 {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&[i; 32]).unwrap();
        clients.push((client, i));
    }
    for (client, i) in clients.iter_mut() {
        let mut reply = [0u8; 32];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [*i; 32]);
    }

    drop(clients);
    stop_server(event_loop, handle);
}

#[test]
fn test_echo_one_mebibyte_in_chunks() {
    let (addr, event_loop, handle) = run_server(Config::default(), echo_setup);

    let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let client = TcpStream::connect(addr).unwrap();
    let mut writer = client.try_clone().unwrap();
    let to_send = payload.clone();

    // Write and read concurrently so neither side's kernel buffer stalls
    // the exchange.
    let writer_thread = thread::spawn(move || {
        for chunk in to_send.chunks(1024) {
            writer.write_all(chunk).unwrap();
        }
    });

    let mut reader = client;
    let mut received = vec![0u8; payload.len()];
    reader.read_exact(&mut received).unwrap();
    writer_thread.join().unwrap();

    assert_eq!(received, payload, "echoed bytes differ");

    drop(reader);
    stop_server(event_loop, handle);
}

#[test]
fn test_half_close_tears_down_connection() {
    let received = Arc::new(Mutex::new(String::new()));
    let down_events = Arc::new(AtomicUsize::new(0));

    let r = received.clone();
    let d = down_events.clone();
    let (addr, event_loop, handle) = run_server(Config::default(), move |server| {
        server.set_message_callback(Arc::new(move |_conn, buf, _at| {
            r.lock().unwrap().push_str(&buf.retrieve_all_as_string());
        }));
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.disconnected() {
                d.fetch_add(1, Ordering::SeqCst);
            }
        }));
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"bye").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    // Server sees our FIN as a zero-length read, closes, and drops the
    // connection; we observe that as EOF.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    assert_eq!(received.lock().unwrap().as_str(), "bye");
    assert_eq!(down_events.load(Ordering::SeqCst), 1);

    stop_server(event_loop, handle);
}

#[test]
fn test_high_water_mark_and_write_complete() {
    const PAYLOAD: usize = 8 * 1024 * 1024;
    const HIGH_WATER: usize = 64 * 1024;

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));

    let hwm = hwm_hits.clone();
    let wc = write_completes.clone();
    let (addr, event_loop, handle) = run_server(Config::default(), move |server| {
        let hwm = hwm.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                conn.set_high_water_mark(HIGH_WATER);
                let hwm = hwm.clone();
                conn.set_high_water_mark_callback(Arc::new(move |_conn, queued| {
                    assert!(queued >= HIGH_WATER);
                    hwm.fetch_add(1, Ordering::SeqCst);
                }));
                // One burst far beyond both the kernel buffer and the
                // watermark.
                conn.send(&vec![0x42u8; PAYLOAD]);
            }
        }));
        server.set_write_complete_callback(Arc::new(move |_conn| {
            wc.fetch_add(1, Ordering::SeqCst);
        }));
    });

    let mut client = TcpStream::connect(addr).unwrap();
    // Let the server's send hit backpressure before we start draining.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(hwm_hits.load(Ordering::SeqCst), 1);

    let mut received = vec![0u8; PAYLOAD];
    client.read_exact(&mut received).unwrap();
    assert!(received.iter().all(|&b| b == 0x42));

    // Output buffer drained exactly once: one write-complete, no second
    // watermark crossing.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(write_completes.load(Ordering::SeqCst), 1);
    assert_eq!(hwm_hits.load(Ordering::SeqCst), 1);

    drop(client);
    stop_server(event_loop, handle);
}

#[test]
fn test_send_from_foreign_thread() {
    // A timer on a second loop sends through the connection from a thread
    // that does not own it; the payload must be forwarded to the owner.
    let (addr, event_loop, handle) = run_server(Config::default(), |server| {
        server.set_message_callback(Arc::new(|conn, buf, _at| {
            let msg = buf.retrieve_all_as_string();
            let conn = conn.clone();
            thread::spawn(move || {
                conn.send(msg.as_bytes());
            })
            .join()
            .unwrap();
        }));
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"roundabout").unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"roundabout");

    drop(client);
    stop_server(event_loop, handle);
}

#[test]
fn test_connections_get_distinct_names() {
    let names = Arc::new(Mutex::new(Vec::new()));
    let n = names.clone();
    let (addr, event_loop, handle) = run_server(Config::default(), move |server| {
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                n.lock().unwrap().push(conn.name().to_string());
            }
        }));
    });

    let c1 = TcpStream::connect(addr).unwrap();
    let c2 = TcpStream::connect(addr).unwrap();

    // Wait for both establishment callbacks.
    for _ in 0..100 {
        if names.lock().unwrap().len() == 2 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let names = names.lock().unwrap().clone();
    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);
    assert!(names[0].starts_with("test:"));
    assert!(names[0].contains('#'));

    drop((c1, c2));
    stop_server(event_loop, handle);
}
