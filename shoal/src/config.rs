//! Client configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::auth::Credential;
use crate::error::Error;

/// Which wire dialect the client speaks to every server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Ascii,
    Binary,
}

/// Reconnection backoff policy.
///
/// A round is `attempts_per_round` consecutive connect attempts with
/// exponentially growing delays from `base_delay` up to `max_delay`. After
/// a failed round the connection is reported down (and drops out of the
/// ring) but keeps retrying in the background.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempts_per_round: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            attempts_per_round: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay before attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Client configuration, constructed through [`Config::builder`].
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) servers: Vec<(SocketAddr, u32)>,
    pub(crate) credentials: Vec<Credential>,
    pub(crate) dialect: Dialect,
    pub(crate) max_inflight: usize,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) connect_timeout: Duration,
    pub(crate) request_timeout: Duration,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    servers: Vec<(SocketAddr, u32)>,
    credentials: Vec<Credential>,
    dialect: Dialect,
    max_inflight: usize,
    reconnect: ReconnectPolicy,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            credentials: Vec::new(),
            dialect: Dialect::Binary,
            max_inflight: 64,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(3),
        }
    }
}

impl ConfigBuilder {
    /// Add a server with weight 1.
    pub fn server(mut self, addr: SocketAddr) -> Self {
        self.servers.push((addr, 1));
        self
    }

    /// Add a server with an explicit ring weight.
    pub fn weighted_server(mut self, addr: SocketAddr, weight: u32) -> Self {
        self.servers.push((addr, weight));
        self
    }

    /// Append a credential to try during the SASL handshake. Credentials
    /// are attempted in the order they were added.
    pub fn credential(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials.push(Credential::new(username, password));
        self
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Maximum pipelined requests per connection. Submissions beyond this
    /// window apply backpressure.
    pub fn max_inflight(mut self, max: usize) -> Self {
        self.max_inflight = max;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<Config, Error> {
        if self.servers.is_empty() {
            return Err(Error::Config("no servers configured".into()));
        }
        if self.servers.iter().any(|&(_, weight)| weight == 0) {
            return Err(Error::Config("server weight must be nonzero".into()));
        }
        if self.max_inflight == 0 {
            return Err(Error::Config("max_inflight must be nonzero".into()));
        }
        // The textual dialect has no authentication commands.
        if !self.credentials.is_empty() && self.dialect == Dialect::Ascii {
            return Err(Error::Config(
                "credentials require the binary dialect".into(),
            ));
        }
        Ok(Config {
            servers: self.servers,
            credentials: self.credentials,
            dialect: self.dialect,
            max_inflight: self.max_inflight,
            reconnect: self.reconnect,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
        })
    }
}
