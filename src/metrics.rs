//! wireline engine metrics.
//!
//! Per-dispatcher counters for connections, bytes, multiplexer health,
//! buffer-pool behavior, and timeout firings.

use crate::counter::{Counter, CounterGroup};
use metriken::{Gauge, metric};

// Counter groups (sharded storage — one shard per dispatcher, no false sharing).
static CONN: CounterGroup = CounterGroup::new();
static BYTES: CounterGroup = CounterGroup::new();
static POLL: CounterGroup = CounterGroup::new();
static POOL: CounterGroup = CounterGroup::new();
static TLS: CounterGroup = CounterGroup::new();
static TIMEOUT: CounterGroup = CounterGroup::new();

/// Counter slot indices for connection metrics.
pub mod conn {
    pub const ACCEPTED: usize = 0;
    pub const ESTABLISHED: usize = 1;
    pub const CLOSED: usize = 2;
}

/// Counter slot indices for byte metrics.
pub mod bytes {
    pub const RECEIVED: usize = 0;
    pub const SENT: usize = 1;
}

/// Counter slot indices for multiplexer health metrics.
pub mod poll {
    pub const WAKEUPS: usize = 0;
    pub const REBUILDS: usize = 1;
}

/// Counter slot indices for buffer pool metrics.
pub mod pool {
    pub const ALLOCATED: usize = 0;
    pub const RECYCLED: usize = 1;
    pub const DISCARDED: usize = 2;
}

/// Counter slot indices for TLS metrics.
pub mod tls {
    pub const HANDSHAKES: usize = 0;
    pub const FAILURES: usize = 1;
}

/// Counter slot indices for timeout metrics.
pub mod timeout {
    pub const IDLE: usize = 0;
    pub const CONNECTION: usize = 1;
    pub const CONNECT: usize = 2;
}

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "wireline/connections/accepted",
    description = "Total inbound connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new(&CONN, conn::ACCEPTED);

#[metric(
    name = "wireline/connections/established",
    description = "Total outbound connections established"
)]
pub static CONNECTIONS_ESTABLISHED: Counter = Counter::new(&CONN, conn::ESTABLISHED);

#[metric(
    name = "wireline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new(&CONN, conn::CLOSED);

#[metric(
    name = "wireline/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "wireline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new(&BYTES, bytes::RECEIVED);

#[metric(name = "wireline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new(&BYTES, bytes::SENT);

// ── Multiplexer health ───────────────────────────────────────────

#[metric(
    name = "wireline/poll/wakeups",
    description = "Dispatcher poll wakeups"
)]
pub static POLL_WAKEUPS: Counter = Counter::new(&POLL, poll::WAKEUPS);

#[metric(
    name = "wireline/poll/rebuilds",
    description = "Multiplexer rebuilds triggered by the spin watchdog"
)]
pub static POLL_REBUILDS: Counter = Counter::new(&POLL, poll::REBUILDS);

// ── Buffer pool ──────────────────────────────────────────────────

#[metric(
    name = "wireline/pool/allocated",
    description = "Fresh buffer allocations"
)]
pub static BUFFERS_ALLOCATED: Counter = Counter::new(&POOL, pool::ALLOCATED);

#[metric(
    name = "wireline/pool/recycled",
    description = "Buffers returned to the pool"
)]
pub static BUFFERS_RECYCLED: Counter = Counter::new(&POOL, pool::RECYCLED);

#[metric(
    name = "wireline/pool/discarded",
    description = "Recycled buffers dropped (pool off, too small, or pool full)"
)]
pub static BUFFERS_DISCARDED: Counter = Counter::new(&POOL, pool::DISCARDED);

// ── TLS ──────────────────────────────────────────────────────────

#[metric(
    name = "wireline/tls/handshakes",
    description = "Completed TLS handshakes"
)]
pub static TLS_HANDSHAKES: Counter = Counter::new(&TLS, tls::HANDSHAKES);

#[metric(
    name = "wireline/tls/failures",
    description = "TLS protocol failures (handshake or record level)"
)]
pub static TLS_FAILURES: Counter = Counter::new(&TLS, tls::FAILURES);

// ── Timeouts ─────────────────────────────────────────────────────

#[metric(
    name = "wireline/timeouts/idle",
    description = "Idle timeouts fired"
)]
pub static IDLE_TIMEOUTS: Counter = Counter::new(&TIMEOUT, timeout::IDLE);

#[metric(
    name = "wireline/timeouts/connection",
    description = "Absolute connection timeouts fired"
)]
pub static CONNECTION_TIMEOUTS: Counter = Counter::new(&TIMEOUT, timeout::CONNECTION);

#[metric(
    name = "wireline/timeouts/connect",
    description = "Outbound connect attempts timed out"
)]
pub static CONNECT_TIMEOUTS: Counter = Counter::new(&TIMEOUT, timeout::CONNECT);
