//! Proxy configuration types and server-string parsing.

use std::fmt;

use thiserror::Error;

/// Default port for incoming proxy clients.
pub const DEFAULT_LISTEN_PORT: u16 = 48138;
/// Default port for the HTML status pages.
pub const DEFAULT_STATUS_PORT: u16 = 48139;
/// First local port used when upstreams are generated with `--num_servers`.
pub const AUTO_SERVER_START_PORT: i32 = 48139;
/// Upper bound for `--num_servers`, keeping the generated ports in the
/// 48139-48160 range.
pub const MAX_NUM_SERVERS: usize = 22;

/// Errors produced while assembling the proxy configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server spec '{spec}': {reason}")]
    InvalidServerSpec { spec: String, reason: &'static str },

    #[error("--servers and --num_servers are mutually exclusive")]
    ServersConflict,

    #[error("one of --servers or --num_servers is required")]
    ServersMissing,

    #[error("--num_servers must be at most {MAX_NUM_SERVERS}, got {0}")]
    TooManyServers(usize),

    #[error("at least one upstream server is required")]
    NoServers,

    #[error("--{0} requires --jumphost")]
    JumphostFlagWithoutJumphost(&'static str),

    #[error("unknown load balancer '{0}' (expected RoundRobin, LeastUsed or UniformRandom)")]
    UnknownBalancer(String),
}

/// A TCP endpoint. `port == -1` means "unspecified".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: i32,
}

impl HostPort {
    pub const UNSPECIFIED_PORT: i32 = -1;

    #[must_use]
    pub fn new(host: impl Into<String>, port: i32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` spec. With `require_port` the port part is
    /// mandatory; otherwise a bare `host` parses with the port unspecified.
    pub fn parse(spec: &str, require_port: bool) -> Result<Self, ConfigError> {
        let spec = spec.trim();
        match spec.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(ConfigError::InvalidServerSpec {
                        spec: spec.to_string(),
                        reason: "missing host",
                    });
                }
                let port: u16 = port.parse().map_err(|_| ConfigError::InvalidServerSpec {
                    spec: spec.to_string(),
                    reason: "port is not a number in 1-65535",
                })?;
                if port == 0 {
                    return Err(ConfigError::InvalidServerSpec {
                        spec: spec.to_string(),
                        reason: "port is not a number in 1-65535",
                    });
                }
                Ok(Self::new(host, i32::from(port)))
            }
            None if require_port => Err(ConfigError::InvalidServerSpec {
                spec: spec.to_string(),
                reason: "missing port",
            }),
            None if spec.is_empty() => Err(ConfigError::InvalidServerSpec {
                spec: spec.to_string(),
                reason: "missing host",
            }),
            None => Ok(Self::new(spec, Self::UNSPECIFIED_PORT)),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// SSH jump-host settings shared by every upstream tunnel.
#[derive(Debug, Clone)]
pub struct JumpHost {
    /// The sshd we tunnel through. Its port may be unspecified.
    pub sshd: HostPort,
    /// The server behind the jump host that every tunnel forwards to.
    pub server: HostPort,
    pub user: Option<String>,
    /// Credentials file passed to ssh as `-i`.
    pub credentials: Option<String>,
    pub compression: bool,
    /// Cipher spec passed to ssh as `-c`.
    pub ciphers: Option<String>,
    /// Alternative ssh binary; defaults to `ssh`.
    pub ssh_binary: Option<String>,
    /// Bind the forward on all interfaces (`*:PORT`).
    pub open_interfaces: bool,
}

/// Load-balancing policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerKind {
    RoundRobin,
    UniformRandom,
    LeastUsed,
}

impl std::str::FromStr for BalancerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RoundRobin" => Ok(Self::RoundRobin),
            "UniformRandom" => Ok(Self::UniformRandom),
            "LeastUsed" => Ok(Self::LeastUsed),
            other => Err(ConfigError::UnknownBalancer(other.to_string())),
        }
    }
}

/// Everything the proxy needs to start. Fixed after init.
#[derive(Debug, Clone)]
pub struct ProxyConfiguration {
    pub listen_port: u16,
    pub status_port: u16,
    pub servers: Vec<HostPort>,
    pub balancer: BalancerKind,
    pub jumphost: Option<JumpHost>,
    pub verbose: bool,
}
