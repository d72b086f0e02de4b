//! Event loop behavior: thread affinity, cross-thread task queueing, and
//! the timer subsystem.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use bellows::EventLoop;

/// Run an event loop on a dedicated thread and hand back its handle.
fn spawn_loop() -> (Arc<EventLoop>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        tx.send(event_loop.clone()).unwrap();
        event_loop.run();
    });
    (rx.recv().unwrap(), handle)
}

fn stop_loop(event_loop: Arc<EventLoop>, handle: thread::JoinHandle<()>) {
    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn test_run_in_loop_crosses_threads() {
    let (event_loop, handle) = spawn_loop();

    let (tx, rx) = mpsc::channel();
    let tx2 = tx.clone();
    event_loop.run_in_loop(move || {
        tx2.send(thread::current().id()).unwrap();
    });
    event_loop.queue_in_loop(move || {
        tx.send(thread::current().id()).unwrap();
    });

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // Both ran on the loop's thread, not ours.
    assert_ne!(first, thread::current().id());
    assert_eq!(first, second);

    stop_loop(event_loop, handle);
}

#[test]
fn test_tasks_queued_during_drain_run_next_iteration() {
    let (event_loop, handle) = spawn_loop();

    let (tx, rx) = mpsc::channel();
    let inner_loop = event_loop.clone();
    event_loop.queue_in_loop(move || {
        // Enqueued mid-drain: must not deadlock, must still run.
        inner_loop.queue_in_loop(move || {
            tx.send(()).unwrap();
        });
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    stop_loop(event_loop, handle);
}

#[test]
#[should_panic(expected = "one EventLoop per thread")]
fn test_second_loop_in_thread_is_fatal() {
    let _first = EventLoop::new().unwrap();
    let _second = EventLoop::new().unwrap();
}

#[test]
fn test_timer_ordering() {
    let (event_loop, handle) = spawn_loop();

    let order = Arc::new(Mutex::new(Vec::new()));
    let o1 = order.clone();
    let o2 = order.clone();
    // Scheduled out of order on purpose.
    event_loop.run_after(Duration::from_millis(80), move || {
        o2.lock().unwrap().push(2);
    });
    event_loop.run_after(Duration::from_millis(20), move || {
        o1.lock().unwrap().push(1);
    });

    thread::sleep(Duration::from_millis(300));
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);

    stop_loop(event_loop, handle);
}

#[test]
fn test_one_shot_fires_exactly_once() {
    let (event_loop, handle) = spawn_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    event_loop.run_after(Duration::from_millis(20), move || {
        c.fetch_add(1, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(300));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    stop_loop(event_loop, handle);
}

#[test]
fn test_cancel_before_expiry() {
    let (event_loop, handle) = spawn_loop();

    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    let id = event_loop.run_after(Duration::from_millis(100), move || {
        f.store(true, Ordering::SeqCst);
    });
    event_loop.cancel(id);

    thread::sleep(Duration::from_millis(300));
    assert!(!fired.load(Ordering::SeqCst));

    stop_loop(event_loop, handle);
}

#[test]
fn test_periodic_fires_repeatedly() {
    let (event_loop, handle) = spawn_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let id = event_loop.run_every(Duration::from_millis(20), move || {
        c.fetch_add(1, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(300));
    event_loop.cancel(id);
    let fired = count.load(Ordering::SeqCst);
    assert!(fired >= 5, "periodic timer fired only {fired} times");

    stop_loop(event_loop, handle);
}

#[test]
fn test_periodic_cancelled_during_expiry_batch_never_rearms() {
    let (event_loop, handle) = spawn_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let target: Arc<OnceLock<bellows::TimerId>> = Arc::new(OnceLock::new());

    // The canceller shares an expiry with the periodic timer's first fire
    // and sorts ahead of it, so the cancel can land while the batch that
    // contains the periodic timer is being processed.
    let canceller_loop = event_loop.clone();
    let slot = target.clone();
    event_loop.run_after(Duration::from_millis(10), move || {
        if let Some(id) = slot.get() {
            canceller_loop.cancel(*id);
        }
    });
    let c = count.clone();
    let id = event_loop.run_every(Duration::from_millis(10), move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    target.set(id).unwrap();

    thread::sleep(Duration::from_millis(200));
    let fired = count.load(Ordering::SeqCst);
    assert!(fired <= 1, "cancelled periodic timer fired {fired} times");

    stop_loop(event_loop, handle);
}

#[test]
fn test_earlier_timer_reschedules_timerfd() {
    let (event_loop, handle) = spawn_loop();

    let long_fired = Arc::new(AtomicBool::new(false));
    let short_fired = Arc::new(AtomicBool::new(false));

    // The 1s timer arms the fd first; the 100ms timer must pull the next
    // expiry forward.
    let lf = long_fired.clone();
    event_loop.run_after(Duration::from_secs(1), move || {
        lf.store(true, Ordering::SeqCst);
    });
    let sf = short_fired.clone();
    event_loop.run_after(Duration::from_millis(100), move || {
        sf.store(true, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(400));
    assert!(short_fired.load(Ordering::SeqCst));
    assert!(!long_fired.load(Ordering::SeqCst));

    thread::sleep(Duration::from_millis(800));
    assert!(long_fired.load(Ordering::SeqCst));

    stop_loop(event_loop, handle);
}

#[test]
fn test_run_at_absolute_deadline() {
    let (event_loop, handle) = spawn_loop();

    let (tx, rx) = mpsc::channel();
    let scheduled = Instant::now();
    event_loop.run_at(scheduled + Duration::from_millis(50), move || {
        tx.send(Instant::now()).unwrap();
    });

    let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(fired_at.duration_since(scheduled) >= Duration::from_millis(50));

    stop_loop(event_loop, handle);
}

#[test]
fn test_quit_from_other_thread_wakes_loop() {
    let (event_loop, handle) = spawn_loop();
    let started = Instant::now();
    // The loop is idle inside a 10s poll; quit must interrupt it.
    stop_loop(event_loop, handle);
    assert!(started.elapsed() < Duration::from_secs(5));
}
