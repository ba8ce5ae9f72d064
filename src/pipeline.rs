//! The per-connection handler pipeline.
//!
//! A pipeline is a closed chain of stages between the application callback
//! boundary and the raw socket: optional write-rate throttling, optional
//! TLS, and the innermost raw stage. Each stage owns its successor and
//! intercepts the data-shaped operations (`write`/`flush`/`on_readable`)
//! while forwarding the structural ones (`close`, accessors). Membership is
//! fixed at construction for the lifetime of the connection; dispatch is a
//! `match` over the variants, not virtual override chains.
//!
//! Inbound data flows raw → TLS (decrypt) → throttle → [`ConnectionHandler`];
//! outbound writes flow throttle → TLS (encrypt) → raw.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read as _, Write as _};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use mio::net::TcpStream;

use crate::buffer::{BufferQueue, LocalPool};
use crate::connection::Connection;
use crate::error::Error;
use crate::throttle::ThrottleStage;
use crate::tls::stage::TlsStage;

/// Correlation id for a submitted write. Echoed back on `on_written` once
/// the transport has confirmed every byte derived from the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteId(pub(crate) u64);

impl WriteId {
    /// The raw id value (diagnostics).
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Internal completion tag threaded through the stage chain. Application
/// writes carry their [`WriteId`]; ciphertext chunks derived by the TLS
/// stage carry a stage-local id that is translated back on acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteTag {
    App(WriteId),
    Cipher(u64),
}

/// Upward callback contract toward the application.
///
/// Callbacks for one connection are never invoked reentrantly from two
/// threads at once: they all run on the connection's owning dispatcher.
/// Fragments left in the `frags` vector after `on_data` returns are
/// retained and re-delivered at the front of the next batch.
#[allow(unused_variables)]
pub trait ConnectionHandler: Send {
    /// Connection established (for TLS connections: handshake complete).
    fn on_connect(&mut self, conn: &Connection) {}

    /// Data available. `total` is the byte count across `frags`.
    fn on_data(&mut self, conn: &Connection, frags: &mut Vec<Bytes>, total: usize);

    /// All fragments of the current batch have been delivered.
    fn on_post_data(&mut self, conn: &Connection) {}

    /// The write identified by `id` has been fully handed to the transport.
    fn on_written(&mut self, conn: &Connection, id: WriteId) {}

    /// A write failed; the connection is about to be closed.
    fn on_write_exception(&mut self, conn: &Connection, error: &io::Error, id: WriteId) {}

    /// Connection closed (clean or after an error).
    fn on_disconnect(&mut self, conn: &Connection) {}

    /// An outbound connect attempt failed or timed out.
    fn on_connect_exception(&mut self, error: &Error) {}

    /// The connection terminated abnormally (transport or protocol error).
    fn on_abnormal_termination(&mut self, conn: &Connection) {}

    /// Idle timeout expired. Return true if handled; false lets the engine
    /// close the connection.
    fn on_idle_timeout(&mut self, conn: &Connection) -> bool {
        false
    }

    /// Absolute connection lifetime expired. Return true if handled; false
    /// lets the engine close the connection.
    fn on_connection_timeout(&mut self, conn: &Connection) -> bool {
        false
    }
}

/// Creates a [`ConnectionHandler`] per accepted connection.
pub trait HandlerFactory: Send + Sync + 'static {
    /// Build the handler for a newly accepted connection.
    fn create(&self) -> Box<dyn ConnectionHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn ConnectionHandler> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn ConnectionHandler> {
        self()
    }
}

/// Capability proving the caller runs on a dispatcher thread. Created only
/// by the dispatcher loop and deliberately neither `Send` nor `Sync`, so it
/// cannot leak to foreign threads. APIs that must not block the event loop
/// take its presence as evidence of misuse.
pub struct LoopToken {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl LoopToken {
    pub(crate) fn new() -> Self {
        LoopToken {
            _not_send: std::marker::PhantomData,
        }
    }
}

/// Mutable context handed down the stage chain by the dispatcher.
pub(crate) struct StageCtx<'a> {
    pub pool: &'a mut LocalPool,
    pub now: Instant,
    #[allow(dead_code)]
    pub token: &'a LoopToken,
}

/// Result of driving the read path for one readiness event.
#[derive(Default)]
pub(crate) struct ReadBatch {
    /// Decrypted/plain fragments ready for the application.
    pub frags: Vec<Bytes>,
    /// Total bytes across `frags`.
    pub total: usize,
    /// Peer closed (TCP EOF or TLS close_notify).
    pub eof: bool,
    /// The TLS handshake completed during this batch. Fires once.
    pub handshake_finished: bool,
    /// A wrap discovered pending unwrap work; run it from the dispatcher
    /// queue instead of recursing inline.
    pub defer_unwrap: bool,
}

/// Which TLS shape a new connection's pipeline gets.
#[derive(Clone)]
pub(crate) enum TlsPlan {
    /// No TLS stage at all.
    None,
    /// Handshake starts at construction, server side.
    ServerAlways(std::sync::Arc<rustls::ServerConfig>),
    /// Handshake starts at construction, client side.
    ClientAlways {
        config: std::sync::Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    },
    /// Starts plain; TLS can be activated mid-stream (STARTTLS-style).
    Activatable {
        server: Option<std::sync::Arc<rustls::ServerConfig>>,
        client: Option<(
            std::sync::Arc<rustls::ClientConfig>,
            rustls::pki_types::ServerName<'static>,
        )>,
    },
}

/// Pipeline construction plan for one connection.
#[derive(Clone)]
pub(crate) struct StagePlan {
    pub tls: TlsPlan,
    /// Write-rate limit in bytes/sec; Some inserts a throttle stage.
    pub write_rate: Option<u64>,
    /// Ciphertext chunking size for the TLS stage.
    pub chunk_size: usize,
}

/// One stage of the pipeline. Outer variants own their successor.
pub(crate) enum Stage {
    Raw(RawStage),
    Throttle(ThrottleStage),
    Tls(Box<TlsStage>),
}

impl Stage {
    /// Assemble the pipeline for a fresh connection.
    pub fn build(
        stream: TcpStream,
        plan: &StagePlan,
        gate: std::sync::Arc<crate::tls::HandshakeGate>,
    ) -> Self {
        let mut stage = Stage::Raw(RawStage::new(stream));
        if !matches!(plan.tls, TlsPlan::None) {
            stage = Stage::Tls(Box::new(TlsStage::new(
                Box::new(stage),
                plan.tls.clone(),
                plan.chunk_size,
                gate,
            )));
        }
        if let Some(rate) = plan.write_rate {
            stage = Stage::Throttle(ThrottleStage::new(Box::new(stage), rate));
        }
        stage
    }

    /// One-time initialization once the connection is registered. The TLS
    /// stage starts its handshake here.
    pub fn init(&mut self, ctx: &mut StageCtx<'_>) -> Result<(), Error> {
        match self {
            Stage::Raw(_) => Ok(()),
            Stage::Throttle(s) => s.next.init(ctx),
            Stage::Tls(s) => s.init(ctx),
        }
    }

    /// Queue outbound data. Never blocks; data-intercepting stages stage it
    /// locally and only forward from `flush`/`hard_flush`.
    pub fn write(
        &mut self,
        frags: Vec<Bytes>,
        tag: Option<WriteTag>,
        ctx: &mut StageCtx<'_>,
    ) -> Result<(), Error> {
        match self {
            Stage::Raw(s) => {
                s.enqueue(frags, tag);
                Ok(())
            }
            Stage::Throttle(s) => s.write(frags, tag),
            Stage::Tls(s) => s.write(frags, tag, ctx),
        }
    }

    /// Push staged data toward the socket, honoring throttling.
    pub fn flush(&mut self, ctx: &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error> {
        match self {
            Stage::Raw(s) => s.flush_out().map_err(Error::Io),
            Stage::Throttle(s) => s.flush(ctx),
            Stage::Tls(s) => s.flush(ctx),
        }
    }

    /// Flush bypassing any throttling (used at close).
    pub fn hard_flush(&mut self, ctx: &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error> {
        match self {
            Stage::Raw(s) => s.flush_out().map_err(Error::Io),
            Stage::Throttle(s) => s.hard_flush(ctx),
            Stage::Tls(s) => s.hard_flush(ctx),
        }
    }

    /// Close the pipeline. `immediate` discards unflushed stage-local data;
    /// otherwise every stage hard-flushes before forwarding.
    pub fn close(&mut self, immediate: bool, ctx: &mut StageCtx<'_>) -> Result<(), Error> {
        match self {
            Stage::Raw(s) => {
                if !immediate {
                    let _ = s.flush_out();
                }
                s.shutdown();
                Ok(())
            }
            Stage::Throttle(s) => s.close(immediate, ctx),
            Stage::Tls(s) => s.close(immediate, ctx),
        }
    }

    /// Drive the read path for one readiness event.
    pub fn on_readable(&mut self, ctx: &mut StageCtx<'_>) -> Result<ReadBatch, Error> {
        match self {
            Stage::Raw(s) => s.read_ready(ctx).map_err(Error::Io),
            Stage::Throttle(s) => s.next.on_readable(ctx),
            Stage::Tls(s) => s.on_readable(ctx),
        }
    }

    /// Drive the write path for one readiness event. Returns completion
    /// tags for fully transported writes.
    pub fn on_writable(&mut self, ctx: &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error> {
        match self {
            Stage::Raw(s) => s.flush_out().map_err(Error::Io),
            Stage::Throttle(s) => s.on_writable(ctx),
            Stage::Tls(s) => s.on_writable(ctx),
        }
    }

    /// Periodic tick for time-based stages (throttle release).
    pub fn on_tick(&mut self, ctx: &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error> {
        match self {
            Stage::Raw(_) => Ok(Vec::new()),
            Stage::Throttle(s) => s.on_tick(ctx),
            Stage::Tls(s) => s.next.on_tick(ctx),
        }
    }

    /// Whether any stage still holds bytes destined for the socket.
    pub fn wants_write(&self) -> bool {
        match self {
            Stage::Raw(s) => !s.out.is_empty(),
            Stage::Throttle(s) => s.has_pending() || s.next.wants_write(),
            Stage::Tls(s) => s.next.wants_write(),
        }
    }

    /// Whether a time-based stage needs periodic ticks.
    pub fn needs_tick(&self) -> bool {
        match self {
            Stage::Raw(_) => false,
            Stage::Throttle(s) => s.has_pending() || s.next.needs_tick(),
            Stage::Tls(s) => s.next.needs_tick(),
        }
    }

    /// The TLS stage, if this pipeline has one.
    pub fn tls_mut(&mut self) -> Option<&mut TlsStage> {
        match self {
            Stage::Raw(_) => None,
            Stage::Throttle(s) => s.next.tls_mut(),
            Stage::Tls(s) => Some(s),
        }
    }

    /// Innermost raw stage (pass-through accessors and registration).
    pub fn raw_mut(&mut self) -> &mut RawStage {
        match self {
            Stage::Raw(s) => s,
            Stage::Throttle(s) => s.next.raw_mut(),
            Stage::Tls(s) => s.next.raw_mut(),
        }
    }

    /// Peer address, delegated to the raw socket.
    #[allow(dead_code)]
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Stage::Raw(s) => s.stream.peer_addr(),
            Stage::Throttle(s) => s.next.peer_addr(),
            Stage::Tls(s) => s.next.peer_addr(),
        }
    }
}

/// Innermost stage: the non-blocking socket plus its outbound queue.
pub(crate) struct RawStage {
    pub(crate) stream: TcpStream,
    out: VecDeque<OutEntry>,
}

struct OutEntry {
    frags: BufferQueue,
    tag: Option<WriteTag>,
}

impl RawStage {
    pub fn new(stream: TcpStream) -> Self {
        RawStage {
            stream,
            out: VecDeque::new(),
        }
    }

    /// Queue fragments for transmission. The tag is acknowledged once every
    /// byte of the entry has been written.
    pub fn enqueue(&mut self, frags: Vec<Bytes>, tag: Option<WriteTag>) {
        let mut q = BufferQueue::new();
        q.append_all(frags);
        if q.is_empty() {
            // Nothing to transport; acknowledge on the next flush by
            // completing the entry immediately.
            if tag.is_some() {
                self.out.push_back(OutEntry { frags: q, tag });
            }
            return;
        }
        self.out.push_back(OutEntry { frags: q, tag });
    }

    /// Gathering write of queued entries until done or `WouldBlock`.
    pub fn flush_out(&mut self) -> io::Result<Vec<WriteTag>> {
        let mut acks = Vec::new();
        'entries: while let Some(entry) = self.out.front_mut() {
            while !entry.frags.is_empty() {
                let frags = entry.frags.drain();
                let slices: Vec<IoSlice<'_>> = frags.iter().map(|f| IoSlice::new(f)).collect();
                match self.stream.write_vectored(&slices) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "socket write returned zero",
                        ));
                    }
                    Ok(mut n) => {
                        crate::metrics::BYTES_SENT.add(n as u64);
                        let mut rest = Vec::new();
                        for frag in frags {
                            if n >= frag.len() {
                                n -= frag.len();
                            } else {
                                rest.push(frag.slice(n..));
                                n = 0;
                            }
                        }
                        entry.frags.add_first_all(rest);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        entry.frags.add_first_all(frags);
                        break 'entries;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                        entry.frags.add_first_all(frags);
                    }
                    Err(e) => return Err(e),
                }
            }
            let entry = self.out.pop_front().expect("front entry just seen");
            if let Some(tag) = entry.tag {
                acks.push(tag);
            }
        }
        Ok(acks)
    }

    /// Read until `WouldBlock` or EOF, producing pool-backed fragments.
    /// The multiplexer is edge-triggered, so stopping early would lose the
    /// readiness edge.
    pub fn read_ready(&mut self, ctx: &mut StageCtx<'_>) -> io::Result<ReadBatch> {
        let mut batch = ReadBatch::default();
        let chunk = ctx.pool.options().chunk_size;
        loop {
            let mut buf = ctx
                .pool
                .acquire(chunk)
                .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e.to_string()))?;
            buf.resize(buf.capacity(), 0);
            match self.stream.read(&mut buf[..]) {
                Ok(0) => {
                    ctx.pool.recycle(buf);
                    batch.eof = true;
                    break;
                }
                Ok(n) => {
                    crate::metrics::BYTES_RECEIVED.add(n as u64);
                    batch.total += n;
                    batch.frags.push(ctx.pool.extract_consumed(buf, n));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ctx.pool.recycle(buf);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    ctx.pool.recycle(buf);
                }
                Err(e) => {
                    ctx.pool.recycle(buf);
                    return Err(e);
                }
            }
        }
        Ok(batch)
    }

    /// Half-close both directions; the fd itself is reclaimed on drop.
    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_id_round_trip() {
        let id = WriteId(42);
        assert_eq!(id.value(), 42);
    }

    #[test]
    fn loop_token_is_not_send() {
        // Compile-time property: LoopToken must not cross threads. This
        // function only exists to fail compilation if that changes.
        fn assert_not_send<T: Send>() {}
        let _ = assert_not_send::<u8>; // usable with Send types
        // assert_not_send::<LoopToken>() must not compile.
    }

    #[test]
    fn stage_plan_defaults() {
        let plan = StagePlan {
            tls: TlsPlan::None,
            write_rate: None,
            chunk_size: 16384,
        };
        assert!(matches!(plan.tls, TlsPlan::None));
    }
}
