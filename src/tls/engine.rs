//! TLS record engine: wraps a rustls connection behind a byte-in/byte-out
//! surface the stage can drive without caring about client/server side.
//!
//! Partial records are handled inside rustls (bytes sit in its deframe
//! buffer until a full record arrives), so unwrap never reports underflow.
//! Undersized plaintext buffers are handled by growing the read estimate
//! and reading again.

use std::collections::HashMap;
use std::io::{self, Read as _, Write as _};
use std::sync::Arc;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection};

use crate::buffer::LocalPool;
use crate::error::Error;
use crate::pipeline::WriteId;

/// Ceiling for the plaintext read estimate. A TLS record carries at most
/// 16 KiB of plaintext, so growth stops well past one record.
const MAX_PLAINTEXT_ESTIMATE: usize = 1 << 18;

/// Side-erased rustls connection.
pub(crate) enum TlsConnKind {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsConnKind {
    fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            TlsConnKind::Server(c) => c.read_tls(rd),
            TlsConnKind::Client(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            TlsConnKind::Server(c) => c.write_tls(wr),
            TlsConnKind::Client(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsConnKind::Server(c) => c.process_new_packets(),
            TlsConnKind::Client(c) => c.process_new_packets(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsConnKind::Server(c) => c.reader(),
            TlsConnKind::Client(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsConnKind::Server(c) => c.writer(),
            TlsConnKind::Client(c) => c.writer(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConnKind::Server(c) => c.wants_write(),
            TlsConnKind::Client(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsConnKind::Server(c) => c.is_handshaking(),
            TlsConnKind::Client(c) => c.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsConnKind::Server(c) => c.send_close_notify(),
            TlsConnKind::Client(c) => c.send_close_notify(),
        }
    }
}

/// Result of feeding ciphertext through [`TlsSession::unwrap`].
#[derive(Default)]
pub(crate) struct UnwrapOutcome {
    /// Decrypted plaintext fragments.
    pub frags: Vec<Bytes>,
    /// Total plaintext bytes.
    pub total: usize,
    /// The handshake completed during this call. Reported once.
    pub handshake_finished: bool,
    /// Peer sent close_notify.
    pub inbound_closed: bool,
}

/// One TLS connection's record state.
pub(crate) struct TlsSession {
    conn: TlsConnKind,
    handshake_done: bool,
    inbound_closed: bool,
    /// Expected plaintext per read pass; doubled when a read fills the
    /// buffer completely, so a single pass usually suffices.
    plaintext_estimate: usize,
    /// Ciphertext scratch reused across `take_ciphertext` calls.
    scratch: Vec<u8>,
}

impl TlsSession {
    pub fn new_server(config: Arc<rustls::ServerConfig>, estimate: usize) -> Result<Self, Error> {
        let conn = ServerConnection::new(config).map_err(Error::Tls)?;
        Ok(Self::wrap_conn(TlsConnKind::Server(conn), estimate))
    }

    pub fn new_client(
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
        estimate: usize,
    ) -> Result<Self, Error> {
        let conn = ClientConnection::new(config, server_name).map_err(Error::Tls)?;
        Ok(Self::wrap_conn(TlsConnKind::Client(conn), estimate))
    }

    fn wrap_conn(conn: TlsConnKind, estimate: usize) -> Self {
        TlsSession {
            conn,
            handshake_done: false,
            inbound_closed: false,
            plaintext_estimate: estimate.max(1024),
            scratch: Vec::new(),
        }
    }

    pub fn handshake_done(&self) -> bool {
        self.handshake_done
    }

    /// Feed ciphertext fragments in, collect plaintext out. Drives the
    /// handshake as a side effect; handshake responses become available via
    /// [`take_ciphertext`](Self::take_ciphertext).
    pub fn unwrap(
        &mut self,
        ciphertext: &[Bytes],
        pool: &mut LocalPool,
    ) -> Result<UnwrapOutcome, Error> {
        let mut out = UnwrapOutcome::default();
        if self.inbound_closed {
            return Ok(out);
        }
        let was_handshaking = !self.handshake_done;
        let mut peer_closed = false;
        for frag in ciphertext {
            let mut cursor = io::Cursor::new(&frag[..]);
            while (cursor.position() as usize) < frag.len() {
                let before = cursor.position();
                self.conn.read_tls(&mut cursor)?;
                let state = self.conn.process_new_packets().map_err(Error::Tls)?;
                if cursor.position() == before && state.plaintext_bytes_to_read() == 0 {
                    return Err(Error::Tls(rustls::Error::General(
                        "tls record buffer made no progress".into(),
                    )));
                }
                peer_closed |= state.peer_has_closed();
                if state.plaintext_bytes_to_read() > 0 {
                    self.read_plaintext(pool, &mut out)?;
                }
            }
        }
        if ciphertext.is_empty() {
            // Activation replay with no buffered bytes still needs one pass
            // so a freshly created server session settles its state.
            let state = self.conn.process_new_packets().map_err(Error::Tls)?;
            peer_closed |= state.peer_has_closed();
        }
        if was_handshaking && !self.conn.is_handshaking() {
            self.handshake_done = true;
            out.handshake_finished = true;
        }
        if peer_closed {
            self.inbound_closed = true;
            out.inbound_closed = true;
        }
        Ok(out)
    }

    fn read_plaintext(&mut self, pool: &mut LocalPool, out: &mut UnwrapOutcome) -> Result<(), Error> {
        loop {
            let mut buf = pool.acquire(self.plaintext_estimate)?;
            buf.resize(buf.capacity(), 0);
            let filled = buf.len();
            match self.conn.reader().read(&mut buf[..]) {
                Ok(0) => {
                    pool.recycle(buf);
                    return Ok(());
                }
                Ok(n) => {
                    if n == filled && self.plaintext_estimate < MAX_PLAINTEXT_ESTIMATE {
                        self.plaintext_estimate *= 2;
                    }
                    out.total += n;
                    out.frags.push(pool.extract_consumed(buf, n));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    pool.recycle(buf);
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    // Clean close surfaces through peer_has_closed.
                    pool.recycle(buf);
                    return Ok(());
                }
                Err(e) => {
                    pool.recycle(buf);
                    return Err(Error::Io(e));
                }
            }
        }
    }

    /// Queue plaintext for encryption. Only meaningful after the handshake;
    /// the stage holds application data back until then so completion
    /// accounting stays exact.
    pub fn write_plain(&mut self, data: &[u8]) -> Result<(), Error> {
        self.conn.writer().write_all(data).map_err(Error::Io)?;
        Ok(())
    }

    /// Drain pending ciphertext (handshake records, encrypted application
    /// data, alerts) into pool-backed chunks of at most `chunk_size` bytes.
    pub fn take_ciphertext(
        &mut self,
        chunk_size: usize,
        pool: &mut LocalPool,
    ) -> Result<Vec<Bytes>, Error> {
        self.scratch.clear();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.scratch)?;
        }
        if self.scratch.is_empty() {
            return Ok(Vec::new());
        }
        let mut chunks = Vec::with_capacity(self.scratch.len().div_ceil(chunk_size));
        for piece in self.scratch.chunks(chunk_size) {
            let mut buf = pool.acquire(piece.len())?;
            buf.extend_from_slice(piece);
            chunks.push(pool.extract_consumed(buf, piece.len()));
        }
        self.scratch.clear();
        Ok(chunks)
    }

    /// Queue a close_notify alert; fetch it with `take_ciphertext`.
    pub fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}

/// Tracks how many ciphertext chunks each tagged write expanded into, so the
/// original [`WriteId`] is acknowledged only after the last chunk lands.
#[derive(Default)]
pub(crate) struct PendingWriteTable {
    remaining: HashMap<u64, u32>,
}

impl PendingWriteTable {
    pub fn start(&mut self, id: WriteId, chunks: u32) {
        debug_assert!(chunks > 0, "tagged write with zero chunks");
        self.remaining.insert(id.0, chunks);
    }

    /// Count one chunk toward `id`. Returns true when the write is fully
    /// transported.
    pub fn ack(&mut self, id: WriteId) -> bool {
        match self.remaining.get_mut(&id.0) {
            Some(left) => {
                *left -= 1;
                if *left == 0 {
                    self.remaining.remove(&id.0);
                    true
                } else {
                    false
                }
            }
            None => {
                debug_assert!(false, "ack for untracked write {}", id.0);
                false
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PoolOptions;

    fn test_pair() -> (TlsSession, TlsSession) {
        let (server_config, client_config, name) = crate::tls::stage::tests::test_tls_configs();
        let server = TlsSession::new_server(server_config, 4096).unwrap();
        let client = TlsSession::new_client(client_config, name, 4096).unwrap();
        (server, client)
    }

    /// Shuttle ciphertext between two sessions until neither has output.
    fn pump(
        a: &mut TlsSession,
        b: &mut TlsSession,
        pool: &mut LocalPool,
    ) -> (Vec<Bytes>, Vec<Bytes>) {
        let mut a_plain = Vec::new();
        let mut b_plain = Vec::new();
        for _ in 0..16 {
            let a_out = a.take_ciphertext(16384, pool).unwrap();
            let b_in = b.unwrap(&a_out, pool).unwrap();
            b_plain.extend(b_in.frags);
            let b_out = b.take_ciphertext(16384, pool).unwrap();
            let a_in = a.unwrap(&b_out, pool).unwrap();
            a_plain.extend(a_in.frags);
            if a_out.is_empty() && b_out.is_empty() {
                break;
            }
        }
        (a_plain, b_plain)
    }

    #[test]
    fn handshake_completes_in_memory() {
        let (mut server, mut client) = test_pair();
        let mut pool = LocalPool::new(PoolOptions::default());
        pump(&mut client, &mut server, &mut pool);
        assert!(server.handshake_done());
        assert!(client.handshake_done());
    }

    #[test]
    fn plaintext_round_trips_both_directions() {
        let (mut server, mut client) = test_pair();
        let mut pool = LocalPool::new(PoolOptions::default());
        pump(&mut client, &mut server, &mut pool);

        client.write_plain(b"from client").unwrap();
        server.write_plain(b"from server").unwrap();
        let (client_got, server_got) = pump(&mut client, &mut server, &mut pool);

        let flat = |frags: Vec<Bytes>| {
            frags
                .iter()
                .flat_map(|f| f.iter().copied())
                .collect::<Vec<u8>>()
        };
        assert_eq!(flat(server_got), b"from client");
        assert_eq!(flat(client_got), b"from server");
    }

    #[test]
    fn close_notify_reported_as_inbound_close() {
        let (mut server, mut client) = test_pair();
        let mut pool = LocalPool::new(PoolOptions::default());
        pump(&mut client, &mut server, &mut pool);

        client.send_close_notify();
        let alert = client.take_ciphertext(16384, &mut pool).unwrap();
        assert!(!alert.is_empty());
        let outcome = server.unwrap(&alert, &mut pool).unwrap();
        assert!(outcome.inbound_closed);
    }

    #[test]
    fn garbage_ciphertext_is_an_error() {
        let (mut server, _client) = test_pair();
        let mut pool = LocalPool::new(PoolOptions::default());
        let garbage = vec![Bytes::from_static(&[0x99; 64])];
        assert!(server.unwrap(&garbage, &mut pool).is_err());
    }

    #[test]
    fn pending_table_acks_after_last_chunk() {
        let mut table = PendingWriteTable::default();
        let id = WriteId(7);
        table.start(id, 3);
        assert!(!table.ack(id));
        assert!(!table.ack(id));
        assert!(table.ack(id));
        assert!(table.is_empty());
    }
}
