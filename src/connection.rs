//! Connection identity and the thread-safe application-facing handle.
//!
//! The dispatcher owns the socket and pipeline; everything else holds a
//! [`Connection`], which forwards operations to the owning dispatcher as
//! queued tasks and never touches the socket itself. Operations are
//! non-blocking with the one documented exception of
//! [`wait_tls_handshake`](Connection::wait_tls_handshake).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::dispatcher::{DispatcherHandle, Task};
use crate::error::Error;
use crate::pipeline::WriteId;
use crate::tls::HandshakeGate;

/// Process-wide engine epoch; activity timestamps are millisecond offsets
/// from it, so they fit an `AtomicU64`.
static EPOCH: OnceLock<Instant> = OnceLock::new();

pub(crate) fn now_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_WRITE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity. Never reused, so a stale id held by
/// a timeout entry or a queued task can only miss, not alias a newer
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub(crate) fn next() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State shared between the dispatcher, the [`Connection`] handle, and the
/// timeout watchdog. Plain atomics throughout; the handshake gate carries
/// its own synchronization.
pub(crate) struct ConnShared {
    pub id: ConnId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub open: AtomicBool,
    pub opened_at_ms: u64,
    pub last_activity_ms: AtomicU64,
    /// 0 disables the idle timeout.
    pub idle_timeout_ms: AtomicU64,
    /// 0 disables the absolute lifetime timeout.
    pub conn_timeout_ms: AtomicU64,
    /// Idle timeout already reported for the current idle period; cleared
    /// by activity so the next idle period can fire again.
    pub idle_fired: AtomicBool,
    /// Lifetime timeout already reported (fires at most once).
    pub lifetime_fired: AtomicBool,
    /// Thread id of the owning dispatcher, set when the connection is
    /// registered; blocking waits from that thread are refused.
    pub loop_thread: OnceLock<std::thread::ThreadId>,
    pub gate: Arc<HandshakeGate>,
}

impl ConnShared {
    pub fn new(
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        idle_timeout: Option<Duration>,
        conn_timeout: Option<Duration>,
    ) -> Self {
        let now = now_ms();
        ConnShared {
            id: ConnId::next(),
            peer_addr,
            local_addr,
            open: AtomicBool::new(true),
            opened_at_ms: now,
            last_activity_ms: AtomicU64::new(now),
            idle_timeout_ms: AtomicU64::new(to_ms(idle_timeout)),
            conn_timeout_ms: AtomicU64::new(to_ms(conn_timeout)),
            idle_fired: AtomicBool::new(false),
            lifetime_fired: AtomicBool::new(false),
            loop_thread: OnceLock::new(),
            gate: Arc::new(HandshakeGate::new()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Record activity; re-arms the idle timeout.
    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
        self.idle_fired.store(false, Ordering::Relaxed);
    }

    pub fn idle_for_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.opened_at_ms)
    }
}

fn to_ms(d: Option<Duration>) -> u64 {
    d.map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Handle to one live connection. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<ConnShared>,
    pub(crate) dispatcher: DispatcherHandle,
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.shared.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Queue one fragment for transmission. Returns the correlation id that
    /// `on_written` will echo once every byte is handed to the transport.
    pub fn write(&self, data: Bytes) -> Result<WriteId, Error> {
        self.write_fragments(vec![data])
    }

    /// Queue several fragments as a single tracked write.
    pub fn write_fragments(&self, frags: Vec<Bytes>) -> Result<WriteId, Error> {
        if !self.shared.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let id = WriteId(NEXT_WRITE_ID.fetch_add(1, Ordering::Relaxed));
        self.dispatcher.send_task(Task::Write {
            conn: self.shared.id,
            frags,
            id,
        })?;
        Ok(id)
    }

    /// Push queued data toward the socket.
    pub fn flush(&self) -> Result<(), Error> {
        self.dispatcher.send_task(Task::Flush {
            conn: self.shared.id,
        })
    }

    /// Graceful close: pending writes are flushed first.
    pub fn close(&self) -> Result<(), Error> {
        self.request_close(false)
    }

    /// Immediate close: unflushed data is abandoned.
    pub fn close_now(&self) -> Result<(), Error> {
        self.request_close(true)
    }

    fn request_close(&self, immediate: bool) -> Result<(), Error> {
        // Refuse new writes right away; the dispatcher finishes teardown.
        self.shared.open.store(false, Ordering::Release);
        self.dispatcher.send_task(Task::Close {
            conn: self.shared.id,
            immediate,
        })
    }

    /// Start collecting subsequent writes into a rewriteable area (length
    /// placeholder pattern). That area is withheld from the socket until
    /// [`remove_write_mark`](Connection::remove_write_mark).
    pub fn mark_write_position(&self) -> Result<(), Error> {
        self.dispatcher.send_task(Task::MarkWrite {
            conn: self.shared.id,
        })
    }

    /// Rewind the marked area so following writes overwrite it from the
    /// start.
    pub fn reset_to_write_mark(&self) -> Result<(), Error> {
        self.dispatcher.send_task(Task::ResetWriteMark {
            conn: self.shared.id,
        })
    }

    /// Release the marked area into the normal outbound flow.
    pub fn remove_write_mark(&self) -> Result<(), Error> {
        self.dispatcher.send_task(Task::RemoveWriteMark {
            conn: self.shared.id,
        })
    }

    /// Pause or resume `on_data` delivery. Inbound bytes accumulate in the
    /// kernel while suspended.
    pub fn suspend_read(&self, suspended: bool) -> Result<(), Error> {
        self.dispatcher.send_task(Task::SuspendRead {
            conn: self.shared.id,
            suspended,
        })
    }

    /// Announce a mid-stream TLS upgrade: plain `on_data` delivery stops so
    /// handshake bytes cannot leak to the application before
    /// [`activate_tls`](Connection::activate_tls).
    pub fn pre_activate_tls(&self) -> Result<(), Error> {
        self.dispatcher.send_task(Task::PreActivateTls {
            conn: self.shared.id,
        })
    }

    /// Upgrade to TLS. `buffered` is ciphertext the application already
    /// read past the switch point; it is replayed before socket bytes.
    pub fn activate_tls(&self, buffered: Vec<Bytes>) -> Result<(), Error> {
        self.dispatcher.send_task(Task::ActivateTls {
            conn: self.shared.id,
            buffered,
        })
    }

    /// Drop back to plaintext after a TLS session.
    pub fn deactivate_tls(&self) -> Result<(), Error> {
        self.dispatcher.send_task(Task::DeactivateTls {
            conn: self.shared.id,
        })
    }

    /// Replace the idle timeout. `None` disables it.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.shared
            .idle_timeout_ms
            .store(to_ms(timeout), Ordering::Relaxed);
        self.shared.touch();
    }

    /// Replace the absolute lifetime timeout. `None` disables it.
    pub fn set_connection_timeout(&self, timeout: Option<Duration>) {
        self.shared
            .conn_timeout_ms
            .store(to_ms(timeout), Ordering::Relaxed);
        self.shared.lifetime_fired.store(false, Ordering::Relaxed);
    }

    /// Time since the last read or write activity.
    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.shared.idle_for_ms(now_ms()))
    }

    /// Block until the TLS handshake settles or `timeout` passes.
    ///
    /// Must not be called on the connection's owning dispatcher thread
    /// (i.e. from inside a callback): the handshake makes progress on that
    /// thread, so waiting there would stall until the timeout. Such calls
    /// fail fast with [`Error::HandshakeOnLoopThread`].
    pub fn wait_tls_handshake(&self, timeout: Duration) -> Result<(), Error> {
        if self
            .shared
            .loop_thread
            .get()
            .is_some_and(|owner| *owner == std::thread::current().id())
        {
            return Err(Error::HandshakeOnLoopThread);
        }
        self.shared.gate.wait(timeout)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer_addr)
            .field("open", &self.shared.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_ids_are_unique_and_monotonic() {
        let a = ConnId::next();
        let b = ConnId::next();
        assert!(b.value() > a.value());
    }

    #[test]
    fn idle_accounting_rearms_on_touch() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let shared = ConnShared::new(addr, addr, Some(Duration::from_secs(1)), None);
        shared.idle_fired.store(true, Ordering::Relaxed);
        shared.touch();
        assert!(!shared.idle_fired.load(Ordering::Relaxed));
        assert!(shared.idle_for_ms(now_ms()) < 1000);
    }

    #[test]
    fn disabled_timeouts_are_zero() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let shared = ConnShared::new(addr, addr, None, None);
        assert_eq!(shared.idle_timeout_ms.load(Ordering::Relaxed), 0);
        assert_eq!(shared.conn_timeout_ms.load(Ordering::Relaxed), 0);
    }

    fn handle_only_connection(shared: Arc<ConnShared>) -> Connection {
        let (dispatcher, _rx) = crate::dispatcher::tests::detached_handle();
        Connection { shared, dispatcher }
    }

    #[test]
    fn handshake_wait_refused_on_owning_dispatcher_thread() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let shared = Arc::new(ConnShared::new(addr, addr, None, None));
        let _ = shared.loop_thread.set(std::thread::current().id());
        let conn = handle_only_connection(shared);
        assert!(matches!(
            conn.wait_tls_handshake(Duration::from_millis(5)),
            Err(Error::HandshakeOnLoopThread)
        ));
    }

    #[test]
    fn handshake_wait_allowed_from_foreign_thread() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let shared = Arc::new(ConnShared::new(addr, addr, None, None));
        // The owning dispatcher is some other thread; this thread must be
        // allowed to wait regardless of what that dispatcher is doing.
        let owner = std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap();
        let _ = shared.loop_thread.set(owner);
        shared.gate.complete();
        let conn = handle_only_connection(shared);
        conn.wait_tls_handshake(Duration::from_millis(100)).unwrap();
    }
}
