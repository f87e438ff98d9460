//! Upstream servers and their telemetry.

use std::io;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{HostPort, JumpHost};
use crate::counter::RateCounter;
use crate::jumphost::JumpHostTunnel;
use crate::tunnel::TcpTunnel;

/// One load-balancer target: its endpoint, its counters, and optionally the
/// ssh tunnel keeping the endpoint reachable.
pub struct Server {
    pub host_port: HostPort,
    byte_rate: RateCounter,
    opened: RateCounter,
    closed: RateCounter,
    failed: RateCounter,
    jumphost_tunnel: Option<JumpHostTunnel>,
}

/// Connect failure from [`Server::establish_tunnel`]. Hands the client socket
/// back so the dispatcher can retry against another server.
pub struct EstablishError {
    pub client: TcpStream,
    pub source: io::Error,
}

impl Server {
    #[must_use]
    pub fn new(host_port: HostPort) -> Self {
        let name = host_port.to_string();
        Self {
            byte_rate: RateCounter::new(format!("{name} byteRate")),
            opened: RateCounter::new(format!("{name} opened")),
            closed: RateCounter::new(format!("{name} closed")),
            failed: RateCounter::new(format!("{name} failed")),
            jumphost_tunnel: None,
            host_port,
        }
    }

    /// A server reached through an ssh tunnel. The tunnel forwards this
    /// server's own local port; call [`start_jumphost`](Self::start_jumphost)
    /// to bring it up.
    #[must_use]
    pub fn with_jumphost(host_port: HostPort, jumphost: &JumpHost) -> Self {
        let tunnel = JumpHostTunnel::new(jumphost, host_port.port);
        let mut server = Self::new(host_port);
        server.jumphost_tunnel = Some(tunnel);
        server
    }

    /// Start the ssh tunnel supervisor, if this server has one.
    pub fn start_jumphost(&self) {
        if let Some(tunnel) = &self.jumphost_tunnel {
            tunnel.start();
        }
    }

    /// Connect to this server and launch a bidirectional tunnel bridging it
    /// to `client`. Returns once the tunnel tasks are spawned; it does not
    /// wait for any data to flow. The caller owns failure bookkeeping.
    pub async fn establish_tunnel(self: &Arc<Self>, client: TcpStream) -> Result<(), EstablishError> {
        match self.connect().await {
            Ok(upstream) => {
                debug!(server = %self.host_port, "established tunnel");
                TcpTunnel::new(client, upstream, Arc::clone(self)).spawn();
                Ok(())
            }
            Err(source) => Err(EstablishError { client, source }),
        }
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let port = u16::try_from(self.host_port.port)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "port out of range"))?;
        TcpStream::connect((self.host_port.host.as_str(), port)).await
    }

    /// Healthy means never attempted, or no connect failures in the last
    /// minute.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.opened.total() == 0 || self.failed.last_minute() == 0
    }

    /// Stop the ssh tunnel supervisor, if any. In-flight tunnels are left to
    /// drain on their own. Idempotent.
    pub fn close(&self) {
        if let Some(tunnel) = &self.jumphost_tunnel {
            tunnel.stop();
        }
    }

    pub fn increment_failed_conn(&self) {
        self.failed.increment_by(1);
    }

    pub fn increment_opened_conn(&self) {
        self.opened.increment_by(1);
    }

    pub fn increment_closed_conn(&self) {
        self.closed.increment_by(1);
    }

    pub fn increment_byte_rate_by(&self, n: u64) {
        self.byte_rate.increment_by(n);
    }

    #[must_use]
    pub fn byte_rate(&self) -> &RateCounter {
        &self.byte_rate
    }

    #[must_use]
    pub fn opened(&self) -> &RateCounter {
        &self.opened
    }

    #[must_use]
    pub fn closed(&self) -> &RateCounter {
        &self.closed
    }

    #[must_use]
    pub fn failed(&self) -> &RateCounter {
        &self.failed
    }
}
