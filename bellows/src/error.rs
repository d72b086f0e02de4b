use std::io;

/// Errors returned by fallible bellows setup paths.
///
/// Runtime I/O failures on established connections are surfaced through
/// connection callbacks, not through this type; programming errors (using a
/// loop from the wrong thread, removing a channel that still has interest)
/// are fatal assertions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket, eventfd, or timerfd setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A worker thread exited before handing its event loop back.
    #[error("worker thread failed to start")]
    WorkerStart,
}
