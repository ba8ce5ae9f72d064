//! TLS pipeline stage.
//!
//! Two shapes share one implementation: always-TLS connections start their
//! handshake at pipeline init, activatable connections start plain and can
//! be upgraded mid-stream (STARTTLS) or downgraded back. State advances
//! through a closed set: `Plain -> Armed -> Handshaking -> Active`, with
//! always-TLS entering directly at `Handshaking`.
//!
//! Application writes submitted during the handshake are buffered as
//! plaintext and wrapped only once the handshake finishes, so each tagged
//! write expands into an exactly known number of ciphertext chunks and its
//! completion can be reported precisely.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;
use crate::pipeline::{ReadBatch, Stage, StageCtx, TlsPlan, WriteTag};
use crate::tls::engine::{PendingWriteTable, TlsSession};
use crate::tls::HandshakeGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsState {
    /// No TLS; bytes pass through untouched.
    Plain,
    /// Upgrade announced; reads are held back so handshake bytes cannot
    /// leak to the application between pre-activation and activation.
    Armed,
    /// Session created, handshake in flight.
    Handshaking,
    /// Handshake complete; records flow.
    Active,
}

pub(crate) struct TlsStage {
    pub(crate) next: Box<Stage>,
    plan: TlsPlan,
    state: TlsState,
    session: Option<TlsSession>,
    /// Plaintext writes awaiting handshake completion.
    held_writes: VecDeque<(Vec<Bytes>, Option<WriteTag>)>,
    /// Reads held while armed, replayed into the session at activation.
    armed_reads: Vec<Bytes>,
    /// Chunk accounting for tagged writes.
    pending: PendingWriteTable,
    /// Ciphertext tag -> originating application write.
    cipher_map: HashMap<u64, crate::pipeline::WriteId>,
    cipher_seq: u64,
    /// Completions discovered outside an ack-returning call; drained on the
    /// next flush or write readiness.
    ready_acks: Vec<WriteTag>,
    gate: Arc<HandshakeGate>,
    chunk_size: usize,
}

impl TlsStage {
    pub fn new(
        next: Box<Stage>,
        plan: TlsPlan,
        chunk_size: usize,
        gate: Arc<HandshakeGate>,
    ) -> Self {
        TlsStage {
            next,
            plan,
            state: TlsState::Plain,
            session: None,
            held_writes: VecDeque::new(),
            armed_reads: Vec::new(),
            pending: PendingWriteTable::default(),
            cipher_map: HashMap::new(),
            cipher_seq: 0,
            ready_acks: Vec::new(),
            gate,
            chunk_size,
        }
    }

    /// Start the handshake for always-TLS shapes. The client side emits its
    /// hello immediately.
    pub fn init(&mut self, ctx: &mut StageCtx<'_>) -> Result<(), Error> {
        match &self.plan {
            TlsPlan::ServerAlways(config) => {
                self.session = Some(TlsSession::new_server(config.clone(), self.chunk_size)?);
                self.state = TlsState::Handshaking;
                Ok(())
            }
            TlsPlan::ClientAlways {
                config,
                server_name,
            } => {
                self.session = Some(TlsSession::new_client(
                    config.clone(),
                    server_name.clone(),
                    self.chunk_size,
                )?);
                self.state = TlsState::Handshaking;
                self.pump_session_output(ctx)?;
                let _ = self.next.flush(ctx)?;
                Ok(())
            }
            TlsPlan::None | TlsPlan::Activatable { .. } => Ok(()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TlsState::Active
    }

    pub fn is_handshaking(&self) -> bool {
        self.state == TlsState::Handshaking
    }

    pub fn write(
        &mut self,
        frags: Vec<Bytes>,
        tag: Option<WriteTag>,
        ctx: &mut StageCtx<'_>,
    ) -> Result<(), Error> {
        match self.state {
            TlsState::Plain | TlsState::Armed => self.next.write(frags, tag, ctx),
            TlsState::Handshaking => {
                self.held_writes.push_back((frags, tag));
                Ok(())
            }
            TlsState::Active => self.wrap_write(frags, tag, ctx),
        }
    }

    fn wrap_write(
        &mut self,
        frags: Vec<Bytes>,
        tag: Option<WriteTag>,
        ctx: &mut StageCtx<'_>,
    ) -> Result<(), Error> {
        let Some(session) = self.session.as_mut() else {
            return self.next.write(frags, tag, ctx);
        };
        for frag in &frags {
            session.write_plain(frag)?;
        }
        let chunks = session.take_ciphertext(self.chunk_size, ctx.pool)?;
        match tag {
            Some(WriteTag::App(id)) if !chunks.is_empty() => {
                self.pending.start(id, chunks.len() as u32);
                for chunk in chunks {
                    self.cipher_seq += 1;
                    self.cipher_map.insert(self.cipher_seq, id);
                    self.next
                        .write(vec![chunk], Some(WriteTag::Cipher(self.cipher_seq)), ctx)?;
                }
            }
            Some(tag) if chunks.is_empty() => {
                // Zero-length write: nothing to transport, done already.
                self.ready_acks.push(tag);
            }
            _ => {
                for chunk in chunks {
                    self.next.write(vec![chunk], None, ctx)?;
                }
            }
        }
        Ok(())
    }

    /// Push any session output (handshake records, alerts) to the next stage.
    fn pump_session_output(&mut self, ctx: &mut StageCtx<'_>) -> Result<(), Error> {
        if let Some(session) = self.session.as_mut() {
            let chunks = session.take_ciphertext(self.chunk_size, ctx.pool)?;
            for chunk in chunks {
                self.next.write(vec![chunk], None, ctx)?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self, ctx: &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error> {
        self.pump_session_output(ctx)?;
        let tags = self.next.flush(ctx)?;
        Ok(self.translate(tags))
    }

    pub fn hard_flush(&mut self, ctx: &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error> {
        self.pump_session_output(ctx)?;
        let tags = self.next.hard_flush(ctx)?;
        Ok(self.translate(tags))
    }

    pub fn on_writable(&mut self, ctx: &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error> {
        let tags = self.next.on_writable(ctx)?;
        Ok(self.translate(tags))
    }

    /// Map inner completions back to application writes. Ciphertext chunks
    /// only complete their originating write once all siblings have landed.
    fn translate(&mut self, tags: Vec<WriteTag>) -> Vec<WriteTag> {
        let mut out: Vec<WriteTag> = self.ready_acks.drain(..).collect();
        for tag in tags {
            match tag {
                WriteTag::App(id) => out.push(WriteTag::App(id)),
                WriteTag::Cipher(seq) => {
                    if let Some(id) = self.cipher_map.remove(&seq) {
                        if self.pending.ack(id) {
                            out.push(WriteTag::App(id));
                        }
                    }
                }
            }
        }
        out
    }

    pub fn on_readable(&mut self, ctx: &mut StageCtx<'_>) -> Result<ReadBatch, Error> {
        match self.state {
            TlsState::Plain => self.next.on_readable(ctx),
            TlsState::Armed => {
                let inner = self.next.on_readable(ctx)?;
                self.armed_reads.extend(inner.frags);
                Ok(ReadBatch {
                    eof: inner.eof,
                    ..ReadBatch::default()
                })
            }
            TlsState::Handshaking | TlsState::Active => {
                let inner = self.next.on_readable(ctx)?;
                let mut batch = self.process_ciphertext(inner.frags, ctx)?;
                batch.eof |= inner.eof;
                Ok(batch)
            }
        }
    }

    fn process_ciphertext(
        &mut self,
        ciphertext: Vec<Bytes>,
        ctx: &mut StageCtx<'_>,
    ) -> Result<ReadBatch, Error> {
        let Some(session) = self.session.as_mut() else {
            let total = ciphertext.iter().map(|f| f.len()).sum();
            return Ok(ReadBatch {
                frags: ciphertext,
                total,
                ..ReadBatch::default()
            });
        };
        let outcome = match session.unwrap(&ciphertext, ctx.pool) {
            Ok(outcome) => outcome,
            Err(e) => {
                crate::metrics::TLS_FAILURES.increment();
                // Best effort: push the fatal alert out before the close.
                let _ = self.pump_session_output(ctx);
                let _ = self.next.hard_flush(ctx);
                if self.state == TlsState::Handshaking {
                    self.gate.fail(&e.to_string());
                }
                return Err(e);
            }
        };
        self.pump_session_output(ctx)?;
        let tags = self.next.flush(ctx)?;
        let deferred = self.translate(tags);
        self.ready_acks.extend(deferred);

        let batch = ReadBatch {
            frags: outcome.frags,
            total: outcome.total,
            eof: outcome.inbound_closed,
            handshake_finished: outcome.handshake_finished,
            defer_unwrap: false,
        };
        if outcome.handshake_finished {
            self.state = TlsState::Active;
            crate::metrics::TLS_HANDSHAKES.increment();
            self.gate.complete();
            while let Some((frags, tag)) = self.held_writes.pop_front() {
                self.wrap_write(frags, tag, ctx)?;
            }
            let _ = self.next.flush(ctx)?;
        }
        Ok(batch)
    }

    /// Announce an upgrade: stop delivering plain reads so no handshake
    /// bytes reach the application before `activate`.
    pub fn pre_activate(&mut self) {
        if self.state == TlsState::Plain {
            self.state = TlsState::Armed;
        }
    }

    /// Upgrade a plain connection to TLS. `buffered` is ciphertext the
    /// application already consumed ahead of the switch; it is replayed
    /// into the fresh session before any socket bytes.
    pub fn activate(
        &mut self,
        buffered: Vec<Bytes>,
        ctx: &mut StageCtx<'_>,
    ) -> Result<ReadBatch, Error> {
        if self.session.is_some() {
            return Ok(ReadBatch::default());
        }
        let session = match &self.plan {
            TlsPlan::Activatable {
                server: Some(config),
                ..
            } => TlsSession::new_server(config.clone(), self.chunk_size)?,
            TlsPlan::Activatable {
                server: None,
                client: Some((config, server_name)),
            } => TlsSession::new_client(config.clone(), server_name.clone(), self.chunk_size)?,
            _ => {
                return Err(Error::Tls(rustls::Error::General(
                    "connection has no activatable tls configuration".into(),
                )))
            }
        };
        self.gate.rearm();
        self.session = Some(session);
        self.state = TlsState::Handshaking;
        let mut cipher = buffered;
        cipher.append(&mut self.armed_reads);
        let mut batch = self.process_ciphertext(cipher, ctx)?;
        // Bytes may have queued on the socket between arming and now; ask
        // the dispatcher for a follow-up read pass.
        batch.defer_unwrap = true;
        Ok(batch)
    }

    /// Drop back to plaintext: send close_notify, discard the session.
    pub fn deactivate(&mut self, ctx: &mut StageCtx<'_>) -> Result<(), Error> {
        if let Some(session) = self.session.as_mut() {
            session.send_close_notify();
            self.pump_session_output(ctx)?;
            let _ = self.next.hard_flush(ctx)?;
        }
        self.session = None;
        self.state = TlsState::Plain;
        Ok(())
    }

    pub fn close(&mut self, immediate: bool, ctx: &mut StageCtx<'_>) -> Result<(), Error> {
        if !immediate {
            if let Some(session) = self.session.as_mut() {
                session.send_close_notify();
                let _ = self.pump_session_output(ctx);
            }
        }
        self.held_writes.clear();
        self.next.close(immediate, ctx)
    }
}
