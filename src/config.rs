use std::sync::Arc;
use std::time::Duration;

/// TLS server configuration. Pass a pre-built rustls ServerConfig.
#[derive(Clone)]
pub struct TlsConfig {
    /// Pre-built rustls ServerConfig. User loads certs/keys and configures ALPN etc.
    pub server_config: Arc<rustls::ServerConfig>,
    /// Accepted connections start plain and upgrade via `activate_tls`
    /// (STARTTLS-style) instead of handshaking immediately.
    pub activatable: bool,
}

impl TlsConfig {
    /// Always-TLS: accepted connections handshake immediately.
    pub fn new(server_config: Arc<rustls::ServerConfig>) -> Self {
        TlsConfig {
            server_config,
            activatable: false,
        }
    }

    /// Activatable: connections start plain, upgrade on demand.
    pub fn activatable(server_config: Arc<rustls::ServerConfig>) -> Self {
        TlsConfig {
            server_config,
            activatable: true,
        }
    }
}

/// TLS client configuration for outbound connections.
#[derive(Clone)]
pub struct TlsClientConfig {
    /// Pre-built rustls ClientConfig. User configures root certs, ALPN, etc.
    pub client_config: Arc<rustls::ClientConfig>,
}

/// Configuration for the connection engine.
#[derive(Clone)]
pub struct Config {
    /// Number of dispatcher threads. 0 = number of CPUs.
    pub dispatchers: usize,
    /// Maximum connections per dispatcher.
    pub max_connections: usize,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Enable TCP_NODELAY on all connections (accepted and outbound).
    pub tcp_nodelay: bool,
    /// Keep and reuse read buffers instead of allocating fresh per read.
    pub preallocation: bool,
    /// Size of freshly allocated read buffers in bytes.
    pub prealloc_chunk_size: usize,
    /// Minimum capacity for a buffer to be worth pooling. Recycled buffers
    /// below this are dropped so tiny remainders don't pollute the pool.
    pub min_reusable_size: usize,
    /// Page-align pool allocations (off-heap-style buffers). Allocation
    /// failures report which mode was in use.
    pub direct_buffers: bool,
    /// Outbound write rate limit in bytes/sec. None = unlimited. When set,
    /// every connection gets a throttling stage in its pipeline.
    pub write_rate: Option<u64>,
    /// Idle timeout: no reads and no writes for this long fires
    /// `on_idle_timeout`. None = disabled.
    pub idle_timeout: Option<Duration>,
    /// Absolute connection lifetime: fires `on_connection_timeout` once the
    /// connection has existed this long. None = disabled.
    pub connection_timeout: Option<Duration>,
    /// Timeout for outbound connect attempts.
    pub connect_timeout: Duration,
    /// Bounded wait for the blocking client-side TLS handshake.
    pub handshake_timeout: Duration,
    /// Maximum time a dispatcher blocks in poll before draining its task
    /// queues. Keeps cross-thread tasks from starving.
    pub poll_timeout: Duration,
    /// Consecutive zero-event early poll returns before the multiplexer is
    /// assumed to be spinning and is rebuilt. Tuning, not a contract.
    pub spin_threshold: u32,
    /// Wall-clock window in which `spin_threshold` must be reached.
    pub spin_window: Duration,
    /// Optional TLS configuration. When set, all accepted connections start
    /// the handshake immediately (always-TLS mode).
    pub tls: Option<TlsConfig>,
    /// Optional TLS client configuration for outbound `connect_tls()` calls
    /// and ad-hoc TLS activation.
    pub tls_client: Option<TlsClientConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatchers: 0,
            max_connections: 16000,
            backlog: 1024,
            tcp_nodelay: true,
            preallocation: true,
            prealloc_chunk_size: 16384,
            min_reusable_size: 64,
            direct_buffers: false,
            write_rate: None,
            idle_timeout: None,
            connection_timeout: None,
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_millis(250),
            spin_threshold: 64,
            spin_window: Duration::from_millis(500),
            tls: None,
            tls_client: None,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.max_connections == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "max_connections must be > 0".into(),
            ));
        }
        if self.prealloc_chunk_size == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "prealloc_chunk_size must be > 0".into(),
            ));
        }
        if self.min_reusable_size > self.prealloc_chunk_size {
            return Err(crate::error::Error::InvalidConfig(
                "min_reusable_size must be <= prealloc_chunk_size".into(),
            ));
        }
        if self.spin_threshold == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "spin_threshold must be > 0".into(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(crate::error::Error::InvalidConfig(
                "poll_timeout must be > 0".into(),
            ));
        }
        if let Some(rate) = self.write_rate {
            if rate == 0 {
                return Err(crate::error::Error::InvalidConfig(
                    "write_rate must be > 0 when set".into(),
                ));
            }
        }
        Ok(())
    }

    /// Effective dispatcher count (resolves 0 to the CPU count).
    pub fn effective_dispatchers(&self) -> usize {
        if self.dispatchers > 0 {
            self.dispatchers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use wireline::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::default()
///     .dispatchers(2)
///     .max_connections(8000)
///     .prealloc_chunk(8192)
///     .idle_timeout(Duration::from_secs(60))
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Dispatcher settings ──────────────────────────────────────────

    /// Set the number of dispatcher threads. 0 = number of CPUs.
    pub fn dispatchers(mut self, n: usize) -> Self {
        self.config.dispatchers = n;
        self
    }

    /// Set the maximum connections per dispatcher.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.max_connections = n;
        self
    }

    /// Set the bounded poll timeout for each dispatcher loop.
    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.config.poll_timeout = d;
        self
    }

    /// Set the spin-watchdog parameters (zero-event poll count and window).
    pub fn spin_watchdog(mut self, threshold: u32, window: Duration) -> Self {
        self.config.spin_threshold = threshold;
        self.config.spin_window = window;
        self
    }

    // ── Connection settings ──────────────────────────────────────────

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY on all connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Set the outbound connect timeout.
    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.config.connect_timeout = d;
        self
    }

    // ── Buffer settings ──────────────────────────────────────────────

    /// Enable or disable buffer preallocation (pooling).
    pub fn preallocation(mut self, enable: bool) -> Self {
        self.config.preallocation = enable;
        self
    }

    /// Set the read buffer chunk size in bytes.
    pub fn prealloc_chunk(mut self, size: usize) -> Self {
        self.config.prealloc_chunk_size = size;
        self
    }

    /// Set the minimum capacity for a recycled buffer to be pooled.
    pub fn min_reusable_size(mut self, size: usize) -> Self {
        self.config.min_reusable_size = size;
        self
    }

    /// Use page-aligned (direct-style) buffer allocations.
    pub fn direct_buffers(mut self, enable: bool) -> Self {
        self.config.direct_buffers = enable;
        self
    }

    // ── Flow control / timeouts ──────────────────────────────────────

    /// Set the per-connection write rate limit in bytes/sec.
    pub fn write_rate(mut self, bytes_per_sec: u64) -> Self {
        self.config.write_rate = Some(bytes_per_sec);
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.config.idle_timeout = Some(d);
        self
    }

    /// Set the absolute connection lifetime timeout.
    pub fn connection_timeout(mut self, d: Duration) -> Self {
        self.config.connection_timeout = Some(d);
        self
    }

    // ── TLS settings ─────────────────────────────────────────────────

    /// Set TLS server configuration (always-TLS for accepted connections).
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.config.tls = Some(config);
        self
    }

    /// Set TLS client configuration for outbound connections.
    pub fn tls_client(mut self, config: TlsClientConfig) -> Self {
        self.config.tls_client = Some(config);
        self
    }

    /// Set the bounded client handshake wait.
    pub fn handshake_timeout(mut self, d: Duration) -> Self {
        self.config.handshake_timeout = d;
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
