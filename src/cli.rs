//! Command-line surface and configuration assembly.

use clap::Parser;

use crate::config::{
    AUTO_SERVER_START_PORT, BalancerKind, ConfigError, DEFAULT_LISTEN_PORT, DEFAULT_STATUS_PORT,
    HostPort, JumpHost, MAX_NUM_SERVERS, ProxyConfiguration,
};

/// Connects clients to multiple replicas of the same server, optionally over
/// ssh tunnels through a jump host.
#[derive(Debug, Parser)]
#[command(
    name = "shunt",
    version = crate::VERSION,
    about = "Listens on a port and load-balances incoming TCP connections over replica upstreams"
)]
pub struct Cli {
    /// Listening port for proxy clients
    #[arg(short = 'p', long = "port", value_name = "PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    pub port: u16,

    /// Port serving the HTML status pages (/stats, /admin)
    #[arg(
        short = 'w',
        long = "webstatus_port",
        value_name = "STATUS_PORT",
        default_value_t = DEFAULT_STATUS_PORT
    )]
    pub webstatus_port: u16,

    /// Upstream servers in host:port format, space-separated
    #[arg(
        short = 's',
        long = "servers",
        value_name = "HOST:PORT",
        num_args = 1..,
        value_delimiter = ' '
    )]
    pub servers: Vec<String>,

    /// Use localhost:48139+i for i in [0, N) as the upstream servers
    #[arg(short = 'n', long = "num_servers", value_name = "N")]
    pub num_servers: Option<usize>,

    /// Load balancing algorithm: RoundRobin, LeastUsed or UniformRandom
    #[arg(
        short = 'b',
        long = "load_balancer",
        value_name = "NAME",
        default_value = "RoundRobin"
    )]
    pub load_balancer: String,

    /// Connect to the servers through an ssh tunnel to this jump host
    /// (host[:port] format)
    #[arg(short = 'j', long = "jumphost", value_name = "HOST[:PORT]")]
    pub jumphost: Option<String>,

    /// Server behind the jump host that every tunnel forwards to (host:port,
    /// port required)
    #[arg(short = 'y', long = "jumphost_server", value_name = "HOST:PORT")]
    pub jumphost_server: Option<String>,

    /// Username for ssh to the jump host
    #[arg(short = 'u', long = "jumphost_user", value_name = "USER")]
    pub jumphost_user: Option<String>,

    /// Credentials file for ssh (ssh -i option)
    #[arg(short = 'i', long = "jumphost_credentials", value_name = "FILE")]
    pub jumphost_credentials: Option<String>,

    /// Enable compression in the ssh tunnels
    #[arg(short = 'C', long = "jumphost_compression")]
    pub jumphost_compression: bool,

    /// Cipher spec for ssh tunnel encryption (ssh -c option)
    #[arg(short = 'c', long = "jumphost_ciphers", value_name = "SPEC")]
    pub jumphost_ciphers: Option<String>,

    /// Alternative path to use as the ssh command
    #[arg(long = "ssh_binary", value_name = "PATH")]
    pub ssh_binary: Option<String>,

    /// Bind the ssh forwards on all interfaces (*:PORT)
    #[arg(short = 'o', long = "openInterfaces")]
    pub open_interfaces: bool,

    /// Debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Cli {
    /// Validate the flags and assemble the proxy configuration.
    pub fn into_config(self) -> Result<ProxyConfiguration, ConfigError> {
        if !self.servers.is_empty() && self.num_servers.is_some() {
            return Err(ConfigError::ServersConflict);
        }
        if self.servers.is_empty() && self.num_servers.is_none() {
            return Err(ConfigError::ServersMissing);
        }

        for (flag, set) in [
            ("jumphost_server", self.jumphost_server.is_some()),
            ("jumphost_user", self.jumphost_user.is_some()),
            ("jumphost_credentials", self.jumphost_credentials.is_some()),
            ("jumphost_compression", self.jumphost_compression),
            ("jumphost_ciphers", self.jumphost_ciphers.is_some()),
            ("ssh_binary", self.ssh_binary.is_some()),
        ] {
            if set && self.jumphost.is_none() {
                return Err(ConfigError::JumphostFlagWithoutJumphost(flag));
            }
        }

        let servers = match self.num_servers {
            Some(n) => {
                if n > MAX_NUM_SERVERS {
                    return Err(ConfigError::TooManyServers(n));
                }
                (0..n)
                    .map(|i| HostPort::new("localhost", AUTO_SERVER_START_PORT + i as i32))
                    .collect()
            }
            None => self
                .servers
                .iter()
                .map(|spec| HostPort::parse(spec, true))
                .collect::<Result<Vec<_>, _>>()?,
        };
        if servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        // The jump host is only active once both its endpoints are known.
        let jumphost = match (&self.jumphost, &self.jumphost_server) {
            (Some(sshd), Some(server)) => Some(JumpHost {
                sshd: HostPort::parse(sshd, false)?,
                server: HostPort::parse(server, true)?,
                user: self.jumphost_user.clone(),
                credentials: self.jumphost_credentials.clone(),
                compression: self.jumphost_compression,
                ciphers: self.jumphost_ciphers.clone(),
                ssh_binary: self.ssh_binary.clone(),
                open_interfaces: self.open_interfaces,
            }),
            _ => None,
        };

        Ok(ProxyConfiguration {
            listen_port: self.port,
            status_port: self.webstatus_port,
            servers,
            balancer: self.load_balancer.parse()?,
            jumphost,
            verbose: self.verbose,
        })
    }
}
