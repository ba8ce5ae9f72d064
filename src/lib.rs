//! wireline — non-blocking TCP/TLS connection engine.
//!
//! wireline runs a pool of dispatcher threads, each owning a readiness
//! selector and a set of connections. Application code implements
//! [`ConnectionHandler`] and receives decoded data, write completions, and
//! lifecycle callbacks on the dispatcher thread that owns the connection.
//! Writes are fragment-based (`bytes::Bytes`), flow through an optional
//! throttle stage and an optional TLS stage, and complete with a
//! correlation id ([`WriteId`]).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use wireline::{ConfigBuilder, Connection, ConnectionHandler, EngineBuilder};
//! use bytes::Bytes;
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_data(&mut self, conn: &Connection, frags: &mut Vec<Bytes>, _total: usize) {
//!         for frag in frags.drain(..) {
//!             conn.write(frag).ok();
//!         }
//!         conn.flush().ok();
//!     }
//! }
//!
//! fn main() -> Result<(), wireline::Error> {
//!     let config = ConfigBuilder::new().dispatchers(2).build()?;
//!     let engine = EngineBuilder::new()
//!         .config(config)
//!         .bind("127.0.0.1:7878".parse().unwrap())
//!         .handler_factory(|| Box::new(Echo) as Box<dyn ConnectionHandler>)
//!         .start()?;
//!     std::thread::park();
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. The acceptor uses `accept4(2)` and the selector is epoll
//! via mio.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod connector;
pub(crate) mod counter;
pub(crate) mod dispatcher;
pub(crate) mod metrics;
pub(crate) mod throttle;
pub(crate) mod timeout;
pub(crate) mod tls;

// ── Public modules ──────────────────────────────────────────────────────
pub mod buffer;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod pipeline;

// ── Re-exports: Configuration ───────────────────────────────────────────

/// Engine configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Client-side TLS configuration.
pub use config::TlsClientConfig;
/// Server-side TLS configuration.
pub use config::TlsConfig;

// ── Re-exports: Engine ──────────────────────────────────────────────────

/// Handle for an outbound connect in flight.
pub use connector::ConnectHandle;
/// Running engine: dispatcher pool, acceptor, connector, timeout watchdog.
pub use engine::Engine;
/// Builder for launching an [`Engine`].
pub use engine::EngineBuilder;
/// Engine errors.
pub use error::Error;

// ── Re-exports: Connections and handlers ────────────────────────────────

/// Stable identifier for a connection.
pub use connection::ConnId;
/// Handle to a live connection, cloneable and usable from any thread.
pub use connection::Connection;
/// Callbacks invoked on the dispatcher thread that owns a connection.
pub use pipeline::ConnectionHandler;
/// Factory that creates one handler per accepted connection.
pub use pipeline::HandlerFactory;
/// Correlation id for a write, reported back via
/// [`ConnectionHandler::on_written`].
pub use pipeline::WriteId;
