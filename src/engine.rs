//! Engine assembly: dispatchers, timeout watchdog, connector, acceptor.
//!
//! [`EngineBuilder`] wires the pieces; [`Engine`] owns the threads and
//! tears everything down in order on shutdown (stop accepting, fail
//! in-flight connects, drain dispatchers, stop the watchdog).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::acceptor::{self, AcceptorConfig, ShutdownHandle};
use crate::config::Config;
use crate::connector::{Attempt, ConnectHandle, Connector};
use crate::dispatcher::DispatcherPool;
use crate::error::Error;
use crate::pipeline::{ConnectionHandler, HandlerFactory, StagePlan, TlsPlan};
use crate::timeout::TimeoutRegistry;

/// Builds and starts an [`Engine`].
pub struct EngineBuilder {
    config: Config,
    bind: Option<SocketAddr>,
    factory: Option<Arc<dyn HandlerFactory>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            config: Config::default(),
            bind: None,
            factory: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Listen on `addr` and accept connections. Without a bind address the
    /// engine is outbound-only.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(addr);
        self
    }

    /// Handler factory for accepted connections. Required when `bind` is
    /// set.
    pub fn handler_factory<F: HandlerFactory>(mut self, factory: F) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Validate, spin up all threads, and start serving.
    pub fn start(self) -> Result<Engine, Error> {
        self.config.validate()?;
        if self.bind.is_some() && self.factory.is_none() {
            return Err(Error::InvalidConfig(
                "bind set without a handler factory".into(),
            ));
        }
        let config = Arc::new(self.config);
        let registry = Arc::new(TimeoutRegistry::new());
        let pool = DispatcherPool::launch(&config, &registry)?;
        let set = pool.set();
        let watchdog = registry.spawn_watchdog().map_err(Error::Io)?;
        let connector = Connector::launch(config.clone(), set.clone())?;

        let mut acceptor = None;
        let mut local_addr = None;
        if let Some(bind) = self.bind {
            let factory = self
                .factory
                .clone()
                .ok_or_else(|| Error::InvalidConfig("bind set without a handler factory".into()))?;
            let listen_fd = acceptor::create_listener(bind, config.backlog)?;
            let bound = acceptor::listener_addr(listen_fd)?;
            let acceptor_config = AcceptorConfig {
                listen_fd,
                set: set.clone(),
                factory,
                plan: server_plan(&config),
                config: config.clone(),
            };
            let thread = std::thread::Builder::new()
                .name("wireline-accept".to_string())
                .spawn(move || acceptor::run_acceptor(acceptor_config))
                .map_err(Error::Io)?;
            info!(addr = %bound, "listening");
            acceptor = Some((ShutdownHandle::new(listen_fd), thread));
            local_addr = Some(bound);
        }

        Ok(Engine {
            config,
            pool: Some(pool),
            registry,
            watchdog: Some(watchdog),
            connector: Some(connector),
            acceptor,
            local_addr,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline shape for accepted connections.
fn server_plan(config: &Config) -> StagePlan {
    let tls = match &config.tls {
        Some(tls) if tls.activatable => TlsPlan::Activatable {
            server: Some(tls.server_config.clone()),
            client: None,
        },
        Some(tls) => TlsPlan::ServerAlways(tls.server_config.clone()),
        None => TlsPlan::None,
    };
    StagePlan {
        tls,
        write_rate: config.write_rate,
        chunk_size: config.prealloc_chunk_size,
    }
}

/// The running engine.
pub struct Engine {
    config: Arc<Config>,
    pool: Option<DispatcherPool>,
    registry: Arc<TimeoutRegistry>,
    watchdog: Option<std::thread::JoinHandle<()>>,
    connector: Option<Connector>,
    acceptor: Option<(ShutdownHandle, std::thread::JoinHandle<()>)>,
    local_addr: Option<SocketAddr>,
}

impl Engine {
    /// The bound listen address, if this engine accepts connections.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start a plain outbound connection. If a TLS client configuration is
    /// present the connection can later be upgraded via `activate_tls`.
    pub fn connect(
        &self,
        addr: SocketAddr,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<ConnectHandle, Error> {
        let tls = match &self.config.tls_client {
            Some(tls) => TlsPlan::Activatable {
                server: None,
                client: Some((
                    tls.client_config.clone(),
                    rustls::pki_types::ServerName::from(rustls::pki_types::IpAddr::from(
                        addr.ip(),
                    )),
                )),
            },
            None => TlsPlan::None,
        };
        self.submit_connect(addr, tls, handler)
    }

    /// Start an outbound TLS connection; the handshake begins as soon as
    /// the TCP connect finishes. `server_name` is used for certificate
    /// verification and SNI.
    pub fn connect_tls(
        &self,
        addr: SocketAddr,
        server_name: &str,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<ConnectHandle, Error> {
        let tls_client = self
            .config
            .tls_client
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("no tls client configuration".into()))?;
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Tls(rustls::Error::General(e.to_string())))?;
        let tls = TlsPlan::ClientAlways {
            config: tls_client.client_config.clone(),
            server_name: name,
        };
        self.submit_connect(addr, tls, handler)
    }

    fn submit_connect(
        &self,
        addr: SocketAddr,
        tls: TlsPlan,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<ConnectHandle, Error> {
        let connector = self
            .connector
            .as_ref()
            .ok_or(Error::DispatcherGone)?;
        let stream = mio::net::TcpStream::connect(addr)?;
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        connector.handle.submit(Attempt {
            stream,
            plan: StagePlan {
                tls,
                write_rate: self.config.write_rate,
                chunk_size: self.config.prealloc_chunk_size,
            },
            handler,
            deadline: Instant::now() + self.config.connect_timeout,
            done_tx,
        })?;
        Ok(ConnectHandle::new(done_rx))
    }

    /// Stop accepting, fail in-flight connects, drain and join every
    /// thread. Called implicitly on drop.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some((handle, thread)) = self.acceptor.take() {
            handle.shutdown();
            let _ = thread.join();
        }
        if let Some(connector) = self.connector.take() {
            connector.handle.shutdown();
            let _ = connector.thread.join();
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        self.registry.shutdown();
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.join();
        }
        debug!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_without_factory_is_rejected() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let err = match EngineBuilder::new().bind(addr).start() {
            Ok(_) => panic!("engine started without a handler factory"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn server_plan_reflects_tls_mode() {
        let config = Config::default();
        assert!(matches!(server_plan(&config).tls, TlsPlan::None));
    }
}
