//! Reactor metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "bytes_received",
    description = "Total bytes read into connection input buffers"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "bytes_sent",
    description = "Total bytes written to connection sockets"
)]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(name = "timers_fired", description = "Total timer callbacks invoked")]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(
    name = "loop_wakeups",
    description = "Total cross-thread eventfd wakeups delivered to event loops"
)]
pub static LOOP_WAKEUPS: Counter = Counter::new();
