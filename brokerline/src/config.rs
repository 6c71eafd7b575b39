use std::time::Duration;

use crate::timer::DEFAULT_WAIT;

/// Port used when `connect` is called without one (AMQP 0-9-1).
pub const DEFAULT_PORT: u16 = 5672;

/// TLS client configuration for outbound connections.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsClientConfig {
    /// Pre-built rustls ClientConfig. User configures root certs, ALPN, etc.
    pub client_config: std::sync::Arc<rustls::ClientConfig>,
    /// Name presented for SNI and certificate validation. `None` = the host
    /// passed to `connect`.
    pub server_name: Option<String>,
}

#[cfg(feature = "tls")]
impl TlsClientConfig {
    pub fn new(client_config: std::sync::Arc<rustls::ClientConfig>) -> Self {
        TlsClientConfig {
            client_config,
            server_name: None,
        }
    }

    /// Override the server name used for SNI and verification.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Configuration for the event loop.
#[derive(Clone)]
pub struct Config {
    /// Capacity of the readiness event buffer handed to each poll.
    pub poll_capacity: usize,
    /// Bounded wait used when no timer is pending and the caller gave no ceiling.
    pub default_wait: Duration,
    /// Overall bound for `wait_for_open`.
    pub open_timeout: Duration,
    /// Port used when `connect` is called with `None`.
    pub default_port: u16,
    /// Enable TCP_NODELAY on outbound connections.
    pub tcp_nodelay: bool,
    /// Maximum number of simultaneously registered transports.
    pub max_connections: usize,
    /// Optional TLS configuration. When set, `connect` negotiates TLS.
    #[cfg(feature = "tls")]
    pub tls: Option<TlsClientConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_capacity: 1024,
            default_wait: DEFAULT_WAIT,
            open_timeout: Duration::from_secs(300),
            default_port: DEFAULT_PORT,
            tcp_nodelay: true,
            max_connections: 4096,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.poll_capacity == 0 {
            return Err(crate::error::Error::Config(
                "poll_capacity must be > 0".into(),
            ));
        }
        if self.default_wait.is_zero() {
            return Err(crate::error::Error::Config(
                "default_wait must be > 0".into(),
            ));
        }
        if self.open_timeout.is_zero() {
            return Err(crate::error::Error::Config(
                "open_timeout must be > 0".into(),
            ));
        }
        if self.max_connections == 0 || self.max_connections >= (1 << 24) {
            return Err(crate::error::Error::Config(
                "max_connections must be > 0 and < 2^24".into(),
            ));
        }
        Ok(())
    }

    /// Whether outbound connections negotiate TLS.
    pub fn tls_enabled(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.tls.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use brokerline::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .poll_capacity(256)
///     .open_timeout(Duration::from_secs(30))
///     .default_port(5673)
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.default_port, 5673);
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

    /// Set the readiness event buffer capacity.
    pub fn poll_capacity(mut self, n: usize) -> Self {
        self.config.poll_capacity = n;
        self
    }

    /// Set the wait used when nothing else bounds an iteration.
    pub fn default_wait(mut self, wait: Duration) -> Self {
        self.config.default_wait = wait;
        self
    }

    /// Set the overall bound for `wait_for_open`.
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    /// Set the port used when `connect` is called without one.
    pub fn default_port(mut self, port: u16) -> Self {
        self.config.default_port = port;
        self
    }

    /// Enable or disable TCP_NODELAY on outbound connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Set the maximum number of registered transports.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.max_connections = n;
        self
    }

    /// Set TLS client configuration for outbound connections.
    #[cfg(feature = "tls")]
    pub fn tls(mut self, config: TlsClientConfig) -> Self {
        self.config.tls = Some(config);
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
