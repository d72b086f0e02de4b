//! Worker loops and the round-robin pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::Error;
use crate::event_loop::EventLoop;

/// Invoked on each worker thread after its loop is constructed, before it
/// starts running.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// A thread running one event loop for its whole lifetime.
///
/// The loop is constructed on the new thread (loops are pinned to their
/// constructing thread) and the handle is passed back over a channel.
/// Dropping quits the loop and joins the thread.
pub(crate) struct EventLoopThread {
    event_loop: Arc<EventLoop>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub(crate) fn start(
        name: String,
        init: Option<ThreadInitCallback>,
    ) -> Result<EventLoopThread, Error> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    match EventLoop::new() {
                        Ok(event_loop) => {
                            if let Some(init) = &init {
                                init(&event_loop);
                            }
                            let _ = tx.send(Ok(event_loop.clone()));
                            event_loop.run();
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                        }
                    }
                }));
                // A callback panic must not unwind silently into thread
                // teardown: log it and take the process down.
                if let Err(panic) = outcome {
                    error!("event loop thread panicked: {}", panic_message(&panic));
                    std::process::abort();
                }
            })
            .map_err(|e| Error::Io(e))?;

        match rx.recv() {
            Ok(Ok(event_loop)) => Ok(EventLoopThread {
                event_loop,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(Error::WorkerStart),
        }
    }

    pub(crate) fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.event_loop.quit();
            let _ = handle.join();
        }
    }
}

/// Owns the I/O worker loops behind a [`TcpServer`](crate::TcpServer) and
/// hands them out round-robin.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    workers: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.to_string(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker loops. 0 keeps everything on the base loop. Must be
    /// set before [`start`](Self::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started.load(Ordering::Acquire));
        self.num_threads.store(num_threads, Ordering::Relaxed);
    }

    pub fn start(&self, init: Option<ThreadInitCallback>) -> Result<(), Error> {
        assert!(!self.started.swap(true, Ordering::AcqRel));
        self.base_loop.assert_in_loop_thread();

        let num_threads = self.num_threads.load(Ordering::Relaxed);
        debug!(num_threads, name = %self.name, "starting event loop pool");
        for i in 0..num_threads {
            let worker =
                EventLoopThread::start(format!("{}-io-{}", self.name, i), init.clone())?;
            self.loops.lock().push(worker.event_loop().clone());
            self.workers.lock().push(worker);
        }
        if num_threads == 0 {
            if let Some(init) = &init {
                init(&self.base_loop);
            }
        }
        Ok(())
    }

    /// Pick the loop for the next connection: round-robin over the workers,
    /// or the base loop when there are none. Base-loop thread only.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started.load(Ordering::Acquire));
        let loops = self.loops.lock();
        if loops.is_empty() {
            self.base_loop.clone()
        } else {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
            loops[index].clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
