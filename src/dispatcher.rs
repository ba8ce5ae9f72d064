//! Readiness dispatchers: one thread, one selector, many connections.
//!
//! Each dispatcher owns a `mio::Poll`, a slab of connections, and a local
//! buffer pool. All socket I/O and all handler callbacks for a connection
//! happen on its owning dispatcher thread; foreign threads communicate
//! through the task channel plus a waker. Connections are addressed across
//! threads by [`ConnId`]; a task naming a connection that has since closed
//! simply misses.
//!
//! The loop carries a spin watchdog: a burst of empty selector returns well
//! before the poll timeout is the signature of a broken selector state, and
//! the dispatcher responds by rebuilding its `Poll` and re-registering every
//! connection rather than burning the core.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::buffer::{BufferQueue, LocalPool, PoolOptions, WriteQueue};
use crate::config::Config;
use crate::connection::{ConnId, ConnShared, Connection};
use crate::error::Error;
use crate::pipeline::{
    ConnectionHandler, LoopToken, ReadBatch, Stage, StageCtx, StagePlan, WriteId, WriteTag,
};
use crate::timeout::{TimeoutKey, TimeoutRegistry};

/// Token reserved for the waker; connection tokens are slab keys.
const WAKE_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// Pause after a selector rebuild so a hard kernel-level fault cannot turn
/// into a rebuild storm.
const REBUILD_BACKOFF: Duration = Duration::from_millis(10);

/// Operations posted to a dispatcher from foreign threads.
pub(crate) enum Task {
    Write {
        conn: ConnId,
        frags: Vec<Bytes>,
        id: WriteId,
    },
    Flush {
        conn: ConnId,
    },
    Close {
        conn: ConnId,
        immediate: bool,
    },
    MarkWrite {
        conn: ConnId,
    },
    ResetWriteMark {
        conn: ConnId,
    },
    RemoveWriteMark {
        conn: ConnId,
    },
    SuspendRead {
        conn: ConnId,
        suspended: bool,
    },
    PreActivateTls {
        conn: ConnId,
    },
    ActivateTls {
        conn: ConnId,
        buffered: Vec<Bytes>,
    },
    DeactivateTls {
        conn: ConnId,
    },
    IdleTimeout {
        conn: ConnId,
    },
    ConnectionTimeout {
        conn: ConnId,
    },
    Shutdown,
}

/// A new connection handed to a dispatcher for ownership.
pub(crate) struct Registration {
    pub stream: mio::net::TcpStream,
    pub plan: StagePlan,
    pub handler: Box<dyn ConnectionHandler>,
    pub shared: Arc<ConnShared>,
}

/// Waker shared with every handle; replaced wholesale when the selector is
/// rebuilt, hence the lock.
pub(crate) struct WakeShared {
    waker: RwLock<Waker>,
}

impl WakeShared {
    fn new(waker: Waker) -> Self {
        WakeShared {
            waker: RwLock::new(waker),
        }
    }

    pub fn wake(&self) {
        let guard = match self.waker.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = guard.wake();
    }

    fn replace(&self, waker: Waker) {
        let mut guard = match self.waker.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = waker;
    }
}

/// Cheap cross-thread handle to one dispatcher.
#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    task_tx: Sender<Task>,
    reg_tx: Sender<Registration>,
    wake: Arc<WakeShared>,
}

impl DispatcherHandle {
    pub fn send_task(&self, task: Task) -> Result<(), Error> {
        self.task_tx.send(task).map_err(|_| Error::DispatcherGone)?;
        self.wake.wake();
        Ok(())
    }

    pub fn register(&self, registration: Registration) -> Result<(), Error> {
        self.reg_tx
            .send(registration)
            .map_err(|_| Error::DispatcherGone)?;
        self.wake.wake();
        Ok(())
    }
}

/// Round-robin view over the pool's dispatchers, shared with the acceptor
/// and connector.
pub(crate) struct DispatcherSet {
    handles: Vec<DispatcherHandle>,
    next: AtomicUsize,
}

impl DispatcherSet {
    pub fn new(handles: Vec<DispatcherHandle>) -> Self {
        DispatcherSet {
            handles,
            next: AtomicUsize::new(0),
        }
    }

    pub fn next_handle(&self) -> DispatcherHandle {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[idx].clone()
    }

    pub fn handles(&self) -> &[DispatcherHandle] {
        &self.handles
    }
}

/// The dispatcher thread pool.
pub(crate) struct DispatcherPool {
    set: Arc<DispatcherSet>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl DispatcherPool {
    pub fn launch(config: &Arc<Config>, registry: &Arc<TimeoutRegistry>) -> Result<Self, Error> {
        let count = config.effective_dispatchers();
        let mut handles = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for index in 0..count {
            let (handle, thread) = spawn_dispatcher(index, config.clone(), registry.clone())?;
            handles.push(handle);
            threads.push(thread);
        }
        Ok(DispatcherPool {
            set: Arc::new(DispatcherSet::new(handles)),
            threads,
        })
    }

    pub fn set(&self) -> Arc<DispatcherSet> {
        self.set.clone()
    }

    /// Ask every dispatcher to drain and stop, then join the threads.
    pub fn shutdown(mut self) {
        for handle in self.set.handles() {
            let _ = handle.send_task(Task::Shutdown);
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn spawn_dispatcher(
    index: usize,
    config: Arc<Config>,
    registry: Arc<TimeoutRegistry>,
) -> Result<(DispatcherHandle, std::thread::JoinHandle<()>), Error> {
    let poll = Poll::new()?;
    let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
    let wake = Arc::new(WakeShared::new(waker));
    let (task_tx, task_rx) = crossbeam_channel::unbounded();
    let (reg_tx, reg_rx) = crossbeam_channel::unbounded();
    let handle = DispatcherHandle {
        task_tx,
        reg_tx,
        wake: wake.clone(),
    };
    let loop_handle = handle.clone();
    let thread = std::thread::Builder::new()
        .name(format!("wireline-dispatch-{index}"))
        .spawn(move || {
            crate::counter::set_dispatcher_shard(index);
            let mut core = DispatchCore {
                index,
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
                conns: Slab::new(),
                by_id: HashMap::new(),
                pool: LocalPool::new(PoolOptions::from_config(&config)),
                task_rx,
                reg_rx,
                wake,
                handle: loop_handle,
                registry,
                token: LoopToken::new(),
                spin: SpinWatchdog::new(config.spin_threshold, config.spin_window),
                deferred: Vec::new(),
                shutting_down: false,
                config,
            };
            debug!(dispatcher = index, "dispatcher started");
            core.run();
            debug!(dispatcher = index, "dispatcher stopped");
        })
        .map_err(Error::Io)?;
    Ok((handle, thread))
}

struct Conn {
    stage: Stage,
    handler: Box<dyn ConnectionHandler>,
    shared: Arc<ConnShared>,
    connection: Connection,
    interest: Interest,
    timeout_key: Option<TimeoutKey>,
    /// `on_connect` delivered (deferred past the handshake for always-TLS).
    connected_reported: bool,
    /// Graceful close pending outbound drain.
    closing: bool,
    suspended: bool,
    /// A readable edge arrived while suspended; replayed on resume.
    read_pending: bool,
    /// Fragments the handler left unconsumed, re-delivered with the next
    /// batch.
    read_q: BufferQueue,
    /// Application-level staging queue, used while a write mark is active.
    app_q: WriteQueue,
    /// Writes captured under the mark, acknowledged when it is removed.
    marked_ids: Vec<WriteId>,
}

enum CloseKind {
    Clean,
    Abnormal,
}

struct DispatchCore {
    index: usize,
    poll: Poll,
    events: Events,
    conns: Slab<Conn>,
    by_id: HashMap<ConnId, usize>,
    pool: LocalPool,
    task_rx: Receiver<Task>,
    reg_rx: Receiver<Registration>,
    wake: Arc<WakeShared>,
    handle: DispatcherHandle,
    registry: Arc<TimeoutRegistry>,
    token: LoopToken,
    spin: SpinWatchdog,
    /// Connections owed a follow-up read pass (post TLS activation).
    deferred: Vec<ConnId>,
    shutting_down: bool,
    config: Arc<Config>,
}

impl DispatchCore {
    fn run(&mut self) {
        loop {
            let timeout = self.poll_timeout();
            let started = Instant::now();
            crate::metrics::POLL_WAKEUPS.increment();
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(dispatcher = self.index, error = %e, "poll failed");
                break;
            }
            let suspicious = self.events.is_empty()
                && started.elapsed() < timeout / 4
                && self.reg_rx.is_empty()
                && self.task_rx.is_empty();
            if self.spin.record(suspicious) {
                if let Err(e) = self.rebuild_selector() {
                    warn!(dispatcher = self.index, error = %e, "selector rebuild failed");
                    break;
                }
                continue;
            }

            while let Ok(registration) = self.reg_rx.try_recv() {
                self.register_conn(registration);
            }
            while let Ok(task) = self.task_rx.try_recv() {
                self.apply_task(task);
            }

            let ready: Vec<(usize, bool, bool)> = self
                .events
                .iter()
                .filter(|e| e.token() != WAKE_TOKEN)
                .map(|e| (e.token().0, e.is_readable() || e.is_read_closed(), e.is_writable()))
                .collect();
            for (slot, readable, writable) in ready {
                if readable {
                    self.handle_readable(slot);
                }
                if writable {
                    self.handle_writable(slot);
                }
            }

            let deferred: Vec<ConnId> = self.deferred.drain(..).collect();
            for conn in deferred {
                if let Some(&slot) = self.by_id.get(&conn) {
                    self.handle_readable(slot);
                }
            }

            if self.config.write_rate.is_some() {
                self.run_ticks();
            }

            if self.shutting_down && self.conns.is_empty() {
                break;
            }
        }
    }

    fn poll_timeout(&self) -> Duration {
        // Throttled connections are released on ticks; poll can't sleep the
        // full interval while any of them holds data.
        if self.config.write_rate.is_some() && self.conns.iter().any(|(_, c)| c.stage.needs_tick())
        {
            self.config.poll_timeout.min(Duration::from_millis(20))
        } else {
            self.config.poll_timeout
        }
    }

    fn ctx<'a>(pool: &'a mut LocalPool, token: &'a LoopToken) -> StageCtx<'a> {
        StageCtx {
            pool,
            now: Instant::now(),
            token,
        }
    }

    // ── Registration ────────────────────────────────────────────────────

    fn register_conn(&mut self, registration: Registration) {
        if self.conns.len() >= self.config.max_connections {
            warn!(
                dispatcher = self.index,
                peer = %registration.shared.peer_addr,
                "connection limit reached, refusing"
            );
            let Registration {
                mut handler, shared, ..
            } = registration;
            // Dropping the registration closes the socket; the handler
            // and any waiters must still learn the connection never was.
            shared.open.store(false, Ordering::Release);
            shared.gate.fail("connection limit reached");
            handler.on_connect_exception(&Error::AtCapacity);
            return;
        }
        let Registration {
            stream,
            plan,
            handler,
            shared,
        } = registration;
        // Blocking handshake waits compare against this to refuse
        // deadlock-prone calls from the owning loop.
        let _ = shared.loop_thread.set(std::thread::current().id());
        let defer_connect = matches!(
            plan.tls,
            crate::pipeline::TlsPlan::ServerAlways(_) | crate::pipeline::TlsPlan::ClientAlways { .. }
        );
        let stage = Stage::build(stream, &plan, shared.gate.clone());
        let connection = Connection {
            shared: shared.clone(),
            dispatcher: self.handle.clone(),
        };
        let timeout_key = Some(self.registry.register(&shared, self.handle.clone()));
        let conn = Conn {
            stage,
            handler,
            shared,
            connection,
            interest: Interest::READABLE,
            timeout_key,
            connected_reported: false,
            closing: false,
            suspended: false,
            read_pending: false,
            read_q: BufferQueue::new(),
            app_q: WriteQueue::new(),
            marked_ids: Vec::new(),
        };
        let slot = self.conns.insert(conn);
        let conn = &mut self.conns[slot];
        self.by_id.insert(conn.shared.id, slot);
        if let Err(e) = self.poll.registry().register(
            &mut conn.stage.raw_mut().stream,
            Token(slot),
            Interest::READABLE,
        ) {
            warn!(dispatcher = self.index, error = %e, "register failed");
            self.close_conn(slot, CloseKind::Abnormal, true);
            return;
        }
        crate::metrics::CONNECTIONS_ESTABLISHED.increment();
        crate::metrics::CONNECTIONS_ACTIVE.increment();
        trace!(dispatcher = self.index, conn = %self.conns[slot].shared.id, "registered");

        let init = {
            let conn = &mut self.conns[slot];
            let mut ctx = Self::ctx(&mut self.pool, &self.token);
            conn.stage.init(&mut ctx)
        };
        if let Err(e) = init {
            warn!(dispatcher = self.index, error = %e, "pipeline init failed");
            self.close_conn(slot, CloseKind::Abnormal, true);
            return;
        }
        if !defer_connect {
            let conn = &mut self.conns[slot];
            conn.connected_reported = true;
            let connection = conn.connection.clone();
            conn.handler.on_connect(&connection);
        }
        // The selector is edge-triggered; bytes that arrived before
        // registration produce no edge, so take one read pass now.
        self.handle_readable(slot);
        self.update_interest(slot);
    }

    // ── Read path ───────────────────────────────────────────────────────

    fn handle_readable(&mut self, slot: usize) {
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        if conn.suspended {
            conn.read_pending = true;
            return;
        }
        conn.shared.touch();
        let batch = {
            let mut ctx = Self::ctx(&mut self.pool, &self.token);
            conn.stage.on_readable(&mut ctx)
        };
        match batch {
            Ok(batch) => self.finish_read(slot, batch),
            Err(e) => {
                debug!(dispatcher = self.index, error = %e, "read failed");
                self.close_conn(slot, CloseKind::Abnormal, true);
            }
        }
    }

    fn finish_read(&mut self, slot: usize, mut batch: ReadBatch) {
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        if batch.handshake_finished && !conn.connected_reported {
            conn.connected_reported = true;
            let connection = conn.connection.clone();
            conn.handler.on_connect(&connection);
        }
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        if !batch.frags.is_empty() || !conn.read_q.is_empty() {
            if !conn.read_q.is_empty() {
                let mut merged = conn.read_q.drain();
                merged.append(&mut batch.frags);
                batch.frags = merged;
            }
            batch.total = batch.frags.iter().map(|f| f.len()).sum();
            if batch.total > 0 {
                let connection = conn.connection.clone();
                conn.handler
                    .on_data(&connection, &mut batch.frags, batch.total);
                conn.handler.on_post_data(&connection);
                // Whatever the handler left unconsumed rides along with the
                // next batch.
                if let Some(conn) = self.conns.get_mut(slot) {
                    conn.read_q.append_all(std::mem::take(&mut batch.frags));
                }
            }
        }
        if batch.defer_unwrap {
            if let Some(conn) = self.conns.get(slot) {
                self.deferred.push(conn.shared.id);
            }
        }
        if batch.eof {
            self.request_close(slot, false, CloseKind::Clean);
        } else {
            self.update_interest(slot);
        }
    }

    // ── Write path ──────────────────────────────────────────────────────

    fn handle_writable(&mut self, slot: usize) {
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        let acks = {
            let mut ctx = Self::ctx(&mut self.pool, &self.token);
            conn.stage.on_writable(&mut ctx)
        };
        match acks {
            Ok(acks) => {
                self.dispatch_acks(slot, acks);
                if let Some(conn) = self.conns.get(slot) {
                    if conn.closing && !conn.stage.wants_write() {
                        self.close_conn(slot, CloseKind::Clean, false);
                        return;
                    }
                }
                self.update_interest(slot);
            }
            Err(e) => {
                debug!(dispatcher = self.index, error = %e, "write failed");
                self.close_conn(slot, CloseKind::Abnormal, true);
            }
        }
    }

    fn dispatch_acks(&mut self, slot: usize, acks: Vec<WriteTag>) {
        if acks.is_empty() {
            return;
        }
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        conn.shared.touch();
        let connection = conn.connection.clone();
        for tag in acks {
            match tag {
                WriteTag::App(id) => conn.handler.on_written(&connection, id),
                // Untranslated ciphertext tags never surface this far.
                WriteTag::Cipher(_) => debug_assert!(false, "ciphertext tag at top level"),
            }
        }
    }

    fn run_ticks(&mut self) {
        let slots: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, c)| c.stage.needs_tick())
            .map(|(slot, _)| slot)
            .collect();
        for slot in slots {
            let Some(conn) = self.conns.get_mut(slot) else {
                continue;
            };
            let acks = {
                let mut ctx = Self::ctx(&mut self.pool, &self.token);
                conn.stage.on_tick(&mut ctx)
            };
            match acks {
                Ok(acks) => {
                    self.dispatch_acks(slot, acks);
                    self.update_interest(slot);
                }
                Err(e) => {
                    debug!(dispatcher = self.index, error = %e, "tick failed");
                    self.close_conn(slot, CloseKind::Abnormal, true);
                }
            }
        }
    }

    // ── Tasks ───────────────────────────────────────────────────────────

    fn apply_task(&mut self, task: Task) {
        match task {
            Task::Write { conn, frags, id } => self.task_write(conn, frags, id),
            Task::Flush { conn } => self.with_stage_acks(conn, |stage, ctx| stage.flush(ctx)),
            Task::Close { conn, immediate } => {
                if let Some(&slot) = self.by_id.get(&conn) {
                    self.request_close(slot, immediate, CloseKind::Clean);
                }
            }
            Task::MarkWrite { conn } => {
                if let Some(&slot) = self.by_id.get(&conn) {
                    let conn = &mut self.conns[slot];
                    // A previous mark is released first, not discarded.
                    if conn.app_q.is_marked() {
                        self.task_remove_mark(slot);
                        // Releasing the mark can close the connection on a
                        // write error; re-check before re-marking.
                        if let Some(conn) = self.conns.get_mut(slot) {
                            conn.app_q.mark_write_position();
                        }
                    } else {
                        conn.app_q.mark_write_position();
                    }
                }
            }
            Task::ResetWriteMark { conn } => {
                if let Some(&slot) = self.by_id.get(&conn) {
                    let conn = &mut self.conns[slot];
                    if !conn.app_q.reset_to_write_mark() {
                        trace!(conn = %conn.shared.id, "reset without active write mark");
                    }
                }
            }
            Task::RemoveWriteMark { conn } => {
                if let Some(&slot) = self.by_id.get(&conn) {
                    self.task_remove_mark(slot);
                }
            }
            Task::SuspendRead { conn, suspended } => {
                if let Some(&slot) = self.by_id.get(&conn) {
                    let conn = &mut self.conns[slot];
                    let was = conn.suspended;
                    conn.suspended = suspended;
                    if was && !suspended && std::mem::take(&mut self.conns[slot].read_pending) {
                        self.handle_readable(slot);
                    }
                }
            }
            Task::PreActivateTls { conn } => {
                if let Some(&slot) = self.by_id.get(&conn) {
                    if let Some(tls) = self.conns[slot].stage.tls_mut() {
                        tls.pre_activate();
                    }
                }
            }
            Task::ActivateTls { conn, buffered } => self.task_activate_tls(conn, buffered),
            Task::DeactivateTls { conn } => {
                if let Some(&slot) = self.by_id.get(&conn) {
                    let result = {
                        let conn = &mut self.conns[slot];
                        let mut ctx = Self::ctx(&mut self.pool, &self.token);
                        match conn.stage.tls_mut() {
                            Some(tls) => tls.deactivate(&mut ctx),
                            None => Ok(()),
                        }
                    };
                    if let Err(e) = result {
                        debug!(error = %e, "tls deactivation failed");
                        self.close_conn(slot, CloseKind::Abnormal, true);
                    } else {
                        self.update_interest(slot);
                    }
                }
            }
            Task::IdleTimeout { conn } => self.task_timeout(conn, true),
            Task::ConnectionTimeout { conn } => self.task_timeout(conn, false),
            Task::Shutdown => {
                self.shutting_down = true;
                let slots: Vec<usize> = self.conns.iter().map(|(slot, _)| slot).collect();
                for slot in slots {
                    self.request_close(slot, false, CloseKind::Clean);
                }
            }
        }
    }

    fn task_write(&mut self, conn: ConnId, frags: Vec<Bytes>, id: WriteId) {
        let Some(&slot) = self.by_id.get(&conn) else {
            trace!(%conn, "write for closed connection dropped");
            return;
        };
        {
            let conn = &mut self.conns[slot];
            if conn.app_q.is_marked() {
                conn.app_q.append_all(frags);
                conn.marked_ids.push(id);
                return;
            }
        }
        let result = {
            let conn = &mut self.conns[slot];
            let mut ctx = Self::ctx(&mut self.pool, &self.token);
            conn.stage
                .write(frags, Some(WriteTag::App(id)), &mut ctx)
                .and_then(|()| conn.stage.flush(&mut ctx))
        };
        match result {
            Ok(acks) => {
                self.dispatch_acks(slot, acks);
                self.update_interest(slot);
            }
            Err(e) => {
                let io_err = match &e {
                    Error::Io(io_err) => io::Error::new(io_err.kind(), io_err.to_string()),
                    other => io::Error::other(other.to_string()),
                };
                let conn = &mut self.conns[slot];
                let connection = conn.connection.clone();
                conn.handler.on_write_exception(&connection, &io_err, id);
                self.close_conn(slot, CloseKind::Abnormal, true);
            }
        }
    }

    /// Release the marked area: its bytes enter the pipeline as one
    /// untagged write, and the captured ids complete when it lands.
    fn task_remove_mark(&mut self, slot: usize) {
        let (frags, ids) = {
            let conn = &mut self.conns[slot];
            if !conn.app_q.is_marked() {
                return;
            }
            conn.app_q.remove_write_mark();
            (conn.app_q.drain(), std::mem::take(&mut conn.marked_ids))
        };
        let result = {
            let conn = &mut self.conns[slot];
            let mut ctx = Self::ctx(&mut self.pool, &self.token);
            conn.stage
                .write(frags, None, &mut ctx)
                .and_then(|()| conn.stage.flush(&mut ctx))
        };
        match result {
            Ok(acks) => {
                let mut all: Vec<WriteTag> = ids.into_iter().map(WriteTag::App).collect();
                all.extend(acks);
                self.dispatch_acks(slot, all);
                self.update_interest(slot);
            }
            Err(e) => {
                debug!(error = %e, "marked flush failed");
                self.close_conn(slot, CloseKind::Abnormal, true);
            }
        }
    }

    fn task_activate_tls(&mut self, conn: ConnId, buffered: Vec<Bytes>) {
        let Some(&slot) = self.by_id.get(&conn) else {
            return;
        };
        let result = {
            let conn = &mut self.conns[slot];
            if conn.stage.tls_mut().is_none() {
                debug!(conn = %conn.shared.id, "tls activation on a pipeline without tls stage");
                return;
            }
            let mut ctx = Self::ctx(&mut self.pool, &self.token);
            let tls = conn.stage.tls_mut().expect("checked above");
            tls.activate(buffered, &mut ctx)
        };
        match result {
            Ok(batch) => self.finish_read(slot, batch),
            Err(e) => {
                debug!(error = %e, "tls activation failed");
                self.close_conn(slot, CloseKind::Abnormal, true);
            }
        }
    }

    fn task_timeout(&mut self, conn: ConnId, idle: bool) {
        let Some(&slot) = self.by_id.get(&conn) else {
            return;
        };
        let handled = {
            let conn = &mut self.conns[slot];
            let connection = conn.connection.clone();
            if idle {
                crate::metrics::IDLE_TIMEOUTS.increment();
                conn.handler.on_idle_timeout(&connection)
            } else {
                crate::metrics::CONNECTION_TIMEOUTS.increment();
                conn.handler.on_connection_timeout(&connection)
            }
        };
        if !handled {
            self.request_close(slot, false, CloseKind::Clean);
        }
    }

    fn with_stage_acks<F>(&mut self, conn: ConnId, f: F)
    where
        F: FnOnce(&mut Stage, &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error>,
    {
        let Some(&slot) = self.by_id.get(&conn) else {
            return;
        };
        let result = {
            let conn = &mut self.conns[slot];
            let mut ctx = Self::ctx(&mut self.pool, &self.token);
            f(&mut conn.stage, &mut ctx)
        };
        match result {
            Ok(acks) => {
                self.dispatch_acks(slot, acks);
                self.update_interest(slot);
            }
            Err(e) => {
                debug!(error = %e, "stage operation failed");
                self.close_conn(slot, CloseKind::Abnormal, true);
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────

    fn request_close(&mut self, slot: usize, immediate: bool, kind: CloseKind) {
        if !immediate {
            let still_draining = {
                let Some(conn) = self.conns.get_mut(slot) else {
                    return;
                };
                let mut ctx = Self::ctx(&mut self.pool, &self.token);
                let _ = conn.stage.hard_flush(&mut ctx);
                conn.stage.wants_write()
            };
            if still_draining {
                let conn = &mut self.conns[slot];
                conn.closing = true;
                self.update_interest(slot);
                return;
            }
        }
        self.close_conn(slot, kind, immediate);
    }

    fn close_conn(&mut self, slot: usize, kind: CloseKind, immediate: bool) {
        if !self.conns.contains(slot) {
            return;
        }
        let mut conn = self.conns.remove(slot);
        self.by_id.remove(&conn.shared.id);
        {
            let mut ctx = Self::ctx(&mut self.pool, &self.token);
            let _ = conn.stage.close(immediate, &mut ctx);
        }
        let _ = self
            .poll
            .registry()
            .deregister(&mut conn.stage.raw_mut().stream);
        if let Some(key) = conn.timeout_key.take() {
            self.registry.deregister(key);
        }
        conn.shared.open.store(false, Ordering::Release);
        conn.shared.gate.fail("connection closed");
        crate::metrics::CONNECTIONS_CLOSED.increment();
        crate::metrics::CONNECTIONS_ACTIVE.decrement();
        trace!(dispatcher = self.index, conn = %conn.shared.id, "closed");
        let connection = conn.connection.clone();
        if matches!(kind, CloseKind::Abnormal) {
            conn.handler.on_abnormal_termination(&connection);
        }
        conn.handler.on_disconnect(&connection);
    }

    // ── Interest and selector maintenance ───────────────────────────────

    fn update_interest(&mut self, slot: usize) {
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        let desired = if conn.stage.wants_write() || conn.closing {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if desired != conn.interest {
            conn.interest = desired;
            let result = self.poll.registry().reregister(
                &mut conn.stage.raw_mut().stream,
                Token(slot),
                desired,
            );
            if let Err(e) = result {
                debug!(error = %e, "reregister failed");
                self.close_conn(slot, CloseKind::Abnormal, true);
            }
        }
    }

    /// Replace a spinning selector: fresh `Poll`, fresh waker, every
    /// connection re-registered.
    fn rebuild_selector(&mut self) -> io::Result<()> {
        warn!(
            dispatcher = self.index,
            conns = self.conns.len(),
            "selector spinning, rebuilding"
        );
        crate::metrics::POLL_REBUILDS.increment();
        let new_poll = Poll::new()?;
        for (slot, conn) in self.conns.iter_mut() {
            let stream = &mut conn.stage.raw_mut().stream;
            let _ = self.poll.registry().deregister(stream);
            new_poll
                .registry()
                .register(stream, Token(slot), conn.interest)?;
        }
        let waker = Waker::new(new_poll.registry(), WAKE_TOKEN)?;
        self.wake.replace(waker);
        self.poll = new_poll;
        std::thread::sleep(REBUILD_BACKOFF);
        Ok(())
    }
}

/// Detects a looping selector: `threshold` consecutive empty early returns
/// inside one observation window.
struct SpinWatchdog {
    threshold: u32,
    window: Duration,
    count: u32,
    window_start: Instant,
}

impl SpinWatchdog {
    fn new(threshold: u32, window: Duration) -> Self {
        SpinWatchdog {
            threshold,
            window,
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Feed one loop observation; true means the selector should be
    /// rebuilt.
    fn record(&mut self, suspicious: bool) -> bool {
        if !suspicious {
            self.count = 0;
            return false;
        }
        if self.count == 0 || self.window_start.elapsed() > self.window {
            self.count = 1;
            self.window_start = Instant::now();
            return false;
        }
        self.count += 1;
        if self.count >= self.threshold {
            self.count = 0;
            return true;
        }
        false
    }
}
