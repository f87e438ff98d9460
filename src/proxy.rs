//! The proxy core: upstream list, dispatch with bounded retry, stats.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::balancer::{self, LoadBalancer};
use crate::config::ProxyConfiguration;
use crate::server::Server;

/// How many upstream connect attempts a single client gets before its
/// connection is dropped.
const RETRY_MAX: usize = 3;

/// Accepts clients on one port and bridges each to a load-balanced upstream.
pub struct TcpProxy {
    name: String,
    version: &'static str,
    listen_port: u16,
    servers: Arc<Vec<Arc<Server>>>,
    balancer: Box<dyn LoadBalancer>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpProxy {
    /// Build the upstream list and the selected balancer. Servers reached
    /// through a jump host get their tunnel supervisors started here.
    #[must_use]
    pub fn new(name: impl Into<String>, config: &ProxyConfiguration) -> Self {
        let mut servers = Vec::with_capacity(config.servers.len());
        for host_port in &config.servers {
            let server = match &config.jumphost {
                Some(jumphost) => {
                    let server = Server::with_jumphost(host_port.clone(), jumphost);
                    server.start_jumphost();
                    server
                }
                None => Server::new(host_port.clone()),
            };
            servers.push(Arc::new(server));
        }
        let servers = Arc::new(servers);
        let balancer = balancer::from_kind(config.balancer, Arc::clone(&servers));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            name: name.into(),
            version: crate::VERSION,
            listen_port: config.listen_port,
            servers,
            balancer,
            shutdown_tx,
        }
    }

    /// Accept clients until the listener fails hard or [`stop`](Self::stop)
    /// is called. Accept errors are logged and the loop continues.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("closing listener");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        debug!(peer = %peer, "accepted client");
                        self.setup_tunnel(client).await;
                    }
                    Err(e) => error!("failed to accept connection: {e}"),
                }
            }
        }
    }

    /// Bridge one accepted client to an upstream, re-picking on connect
    /// failure up to [`RETRY_MAX`] times. Returns once the tunnel tasks are
    /// spawned. On exhausted retries the client socket is dropped, which
    /// closes it.
    pub async fn setup_tunnel(&self, mut client: TcpStream) {
        for _ in 0..RETRY_MAX {
            let server = self.balancer.pick();
            match server.establish_tunnel(client).await {
                Ok(()) => return,
                Err(e) => {
                    error!(server = %server.host_port, "error while connecting to server: {}", e.source);
                    server.increment_failed_conn();
                    client = e.client;
                }
            }
        }
        debug!("dropping client after {RETRY_MAX} failed connect attempts");
        drop(client);
    }

    /// Close every upstream (stopping ssh tunnel supervisors) and break the
    /// accept loop. In-flight tunnels drain on their own.
    pub fn stop(&self) {
        info!("stopping proxy");
        for server in self.servers.iter() {
            server.close();
        }
        self.shutdown_tx.send_replace(true);
    }

    #[must_use]
    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        self.version
    }

    #[must_use]
    pub fn healthy_server_count(&self) -> usize {
        self.servers.iter().filter(|s| s.is_healthy()).count()
    }

    /// Whether any upstream is healthy; drives the `/admin` status code.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy_server_count() > 0
    }

    /// Render the auto-refreshing `/stats` page: aggregate and per-server
    /// byte rates, failure rates, and connection totals.
    #[must_use]
    pub fn server_stats_html(&self) -> String {
        let mut opened_connections = 0u64;
        let mut closed_connections = 0u64;
        let mut last_second_byte_rate = 0u64;
        let mut last_minute_byte_rate = 0u64;
        let mut last_hour_byte_rate = 0u64;
        for server in self.servers.iter() {
            opened_connections += server.opened().total();
            closed_connections += server.closed().total();
            last_second_byte_rate += server.byte_rate().last_second();
            last_minute_byte_rate += server.byte_rate().last_minute();
            last_hour_byte_rate += server.byte_rate().last_hour();
        }

        let mut html = String::new();
        html.push_str("<head><meta http-equiv=\"refresh\" content=\"5\" /></head>\r\n");
        html.push_str(
            "<style> table, th, td { padding: 3px; border: 1px solid black; \
             border-collapse: collapse; text-align: right;} </style>\r\n",
        );
        html.push_str(&format!("<TITLE>{} Status</TITLE>\r\n", self.name));
        html.push_str(&format!(
            "<b>{}</b> - {}<br/><br/><br/>\r\n",
            self.name, self.listen_port
        ));

        html.push_str("<table>\r\n");
        html.push_str("<tr><td><b>counters</b></td><td><b>values</b></td></tr>\r\n");
        html.push_str(&format!(
            "<tr><td>Open connections</td><td>{}</td></tr>\r\n",
            opened_connections - closed_connections
        ));
        html.push_str(&format!(
            "<tr><td><b>server</b> byte rate</td><td><table><tr>\
             <td>{last_second_byte_rate} B/s</td>\
             <td>{last_minute_byte_rate} B/min</td>\
             <td>{last_hour_byte_rate} B/h</td>\
             </tr></table></td></tr>\r\n"
        ));

        for server in self.servers.iter() {
            html.push_str(&format!(
                "<tr><td><b>{}</b> byte rate</td><td><table><tr>\
                 <td>{} B/s</td><td>{} B/min</td><td>{} B/h</td>\
                 </tr></table></td></tr>\r\n",
                server.host_port,
                server.byte_rate().last_second(),
                server.byte_rate().last_minute(),
                server.byte_rate().last_hour(),
            ));
        }

        for server in self.servers.iter() {
            html.push_str(&format!(
                "<tr><td><b>{}</b> failed connections</td><td><table><tr>\
                 <td>{} /s</td><td>{} /min</td><td>{} /h</td>\
                 </tr></table></td></tr>\r\n",
                server.host_port,
                server.failed().last_second(),
                server.failed().last_minute(),
                server.failed().last_hour(),
            ));
        }

        html.push_str(&format!(
            "<tr><td>opened connections</td><td>{opened_connections}</td></tr>\r\n"
        ));
        html.push_str(&format!(
            "<tr><td>closed connections</td><td>{closed_connections}</td></tr>\r\n"
        ));
        html.push_str("</table>\r\n");
        html.push_str(&format!(
            "Healthy servers {} out of {}",
            self.healthy_server_count(),
            self.servers.len()
        ));

        html
    }
}
