//! Asynchronous outbound connector.
//!
//! One thread owns every in-flight connect attempt: `Engine::connect`
//! starts a non-blocking TCP connect and parks the socket here until the
//! kernel reports write readiness. Success hands the socket to a dispatcher
//! like any accepted connection; failure and deadline expiry report through
//! `on_connect_exception` and the returned [`ConnectHandle`].

use std::io;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::connection::{ConnShared, Connection};
use crate::dispatcher::{DispatcherSet, Registration};
use crate::error::Error;
use crate::pipeline::{ConnectionHandler, StagePlan};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Poll ceiling while attempts are pending; keeps deadline checks timely.
const MAX_SCAN: Duration = Duration::from_millis(250);
const MIN_SCAN: Duration = Duration::from_millis(10);

pub(crate) enum ConnectorMsg {
    Connect(Box<Attempt>),
    Shutdown,
}

/// One outbound attempt in flight.
pub(crate) struct Attempt {
    pub stream: mio::net::TcpStream,
    pub plan: StagePlan,
    pub handler: Box<dyn ConnectionHandler>,
    pub deadline: Instant,
    pub done_tx: Sender<Result<Connection, Error>>,
}

/// Completion side of one connect attempt.
pub struct ConnectHandle {
    rx: Receiver<Result<Connection, Error>>,
}

impl ConnectHandle {
    pub(crate) fn new(rx: Receiver<Result<Connection, Error>>) -> Self {
        ConnectHandle { rx }
    }

    /// Block until the attempt settles or `timeout` passes.
    pub fn wait(self, timeout: Duration) -> Result<Connection, Error> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout),
        }
    }

    /// Non-blocking check; `None` while still in flight.
    pub fn try_result(&self) -> Option<Result<Connection, Error>> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone)]
pub(crate) struct ConnectorHandle {
    tx: Sender<ConnectorMsg>,
    wake: std::sync::Arc<Waker>,
}

impl ConnectorHandle {
    pub fn submit(&self, attempt: Attempt) -> Result<(), Error> {
        self.tx
            .send(ConnectorMsg::Connect(Box::new(attempt)))
            .map_err(|_| Error::DispatcherGone)?;
        let _ = self.wake.wake();
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ConnectorMsg::Shutdown);
        let _ = self.wake.wake();
    }
}

pub(crate) struct Connector {
    pub handle: ConnectorHandle,
    pub thread: std::thread::JoinHandle<()>,
}

impl Connector {
    pub fn launch(
        config: std::sync::Arc<Config>,
        set: std::sync::Arc<DispatcherSet>,
    ) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = std::sync::Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = ConnectorHandle {
            tx,
            wake: waker.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("wireline-connector".to_string())
            .spawn(move || {
                let mut core = ConnectorCore {
                    poll,
                    events: Events::with_capacity(64),
                    pending: Slab::new(),
                    rx,
                    config,
                    set,
                };
                debug!("connector started");
                core.run();
                debug!("connector stopped");
            })
            .map_err(Error::Io)?;
        Ok(Connector { handle, thread })
    }
}

struct ConnectorCore {
    poll: Poll,
    events: Events,
    pending: Slab<Attempt>,
    rx: Receiver<ConnectorMsg>,
    config: std::sync::Arc<Config>,
    set: std::sync::Arc<DispatcherSet>,
}

impl ConnectorCore {
    fn run(&mut self) {
        loop {
            let timeout = self.scan_period();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "connector poll failed");
                break;
            }
            let mut shutdown = false;
            while let Ok(msg) = self.rx.try_recv() {
                match msg {
                    ConnectorMsg::Connect(attempt) => self.admit(*attempt),
                    ConnectorMsg::Shutdown => shutdown = true,
                }
            }
            if shutdown {
                self.fail_all();
                break;
            }
            let ready: Vec<usize> = self
                .events
                .iter()
                .filter(|e| e.token() != WAKE_TOKEN)
                .map(|e| e.token().0)
                .collect();
            for slot in ready {
                self.check_attempt(slot);
            }
            self.expire_deadlines();
        }
    }

    /// Poll no longer than the time to the nearest deadline.
    fn scan_period(&self) -> Option<Duration> {
        let now = Instant::now();
        self.pending
            .iter()
            .map(|(_, a)| a.deadline.saturating_duration_since(now))
            .min()
            .map(|d| d.clamp(MIN_SCAN, MAX_SCAN))
    }

    fn admit(&mut self, attempt: Attempt) {
        let slot = self.pending.insert(attempt);
        let attempt = &mut self.pending[slot];
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut attempt.stream, Token(slot), Interest::WRITABLE)
        {
            let attempt = self.pending.remove(slot);
            finish_failed(attempt, Error::Io(e));
        }
    }

    /// Write readiness on a connecting socket: either the connect finished
    /// or it failed; `take_error` disambiguates.
    fn check_attempt(&mut self, slot: usize) {
        if !self.pending.contains(slot) {
            return;
        }
        let outcome = {
            let attempt = &mut self.pending[slot];
            match attempt.stream.take_error() {
                Ok(Some(e)) => Some(Err(Error::Io(e))),
                Ok(None) => match attempt.stream.peer_addr() {
                    Ok(_) => Some(Ok(())),
                    Err(ref e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        None
                    }
                    Err(e) => Some(Err(Error::Io(e))),
                },
                Err(e) => Some(Err(Error::Io(e))),
            }
        };
        match outcome {
            None => {}
            Some(Ok(())) => {
                let mut attempt = self.pending.remove(slot);
                let _ = self.poll.registry().deregister(&mut attempt.stream);
                self.establish(attempt);
            }
            Some(Err(e)) => {
                let mut attempt = self.pending.remove(slot);
                let _ = self.poll.registry().deregister(&mut attempt.stream);
                finish_failed(attempt, e);
            }
        }
    }

    fn establish(&mut self, attempt: Attempt) {
        let Attempt {
            stream,
            plan,
            handler,
            done_tx,
            ..
        } = attempt;
        if self.config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        let peer = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                finish_failed(
                    Attempt {
                        stream,
                        plan,
                        handler,
                        deadline: Instant::now(),
                        done_tx,
                    },
                    Error::Io(e),
                );
                return;
            }
        };
        let local = stream.local_addr().unwrap_or(peer);
        trace!(%peer, "outbound connection established");
        let shared = std::sync::Arc::new(ConnShared::new(
            peer,
            local,
            self.config.idle_timeout,
            self.config.connection_timeout,
        ));
        let dispatcher = self.set.next_handle();
        let connection = Connection {
            shared: shared.clone(),
            dispatcher: dispatcher.clone(),
        };
        let registration = Registration {
            stream,
            plan,
            handler,
            shared,
        };
        match dispatcher.register(registration) {
            Ok(()) => {
                let _ = done_tx.send(Ok(connection));
            }
            Err(e) => {
                let _ = done_tx.send(Err(e));
            }
        }
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, a)| a.deadline <= now)
            .map(|(slot, _)| slot)
            .collect();
        for slot in expired {
            let mut attempt = self.pending.remove(slot);
            let _ = self.poll.registry().deregister(&mut attempt.stream);
            crate::metrics::CONNECT_TIMEOUTS.increment();
            finish_failed(attempt, Error::ConnectTimeout);
        }
    }

    fn fail_all(&mut self) {
        let slots: Vec<usize> = self.pending.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            let mut attempt = self.pending.remove(slot);
            let _ = self.poll.registry().deregister(&mut attempt.stream);
            finish_failed(attempt, Error::ConnectionClosed);
        }
    }
}

fn finish_failed(mut attempt: Attempt, error: Error) {
    debug!(error = %error, "connect attempt failed");
    attempt.handler.on_connect_exception(&error);
    let _ = attempt.done_tx.send(Err(error));
}
