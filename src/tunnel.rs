//! Bidirectional byte tunneling between a client and an upstream server.
//!
//! A [`TcpTunnel`] pairs the accepted client socket with a freshly connected
//! upstream socket and pumps bytes in both directions, one task per
//! direction. The two halves do not coordinate beyond waking each other up
//! when one of them finishes, so whichever side closes first tears the whole
//! tunnel down.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::debug;

use crate::counter::RateCounter;
use crate::server::Server;

const BUFFER_SIZE: usize = 8 * 1024;

/// A client/upstream socket pair bound to the server whose counters it feeds.
pub struct TcpTunnel {
    client: TcpStream,
    upstream: TcpStream,
    server: Arc<Server>,
}

impl TcpTunnel {
    #[must_use]
    pub fn new(client: TcpStream, upstream: TcpStream, server: Arc<Server>) -> Self {
        Self {
            client,
            upstream,
            server,
        }
    }

    /// Spawn both half-tunnel tasks and return without waiting for them.
    pub fn spawn(self) {
        let Self {
            client,
            upstream,
            server,
        } = self;
        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();
        let closing = Arc::new(Notify::new());

        tokio::spawn(run_half(
            "client-upstream",
            client_read,
            upstream_write,
            Arc::clone(&server),
            Arc::clone(&closing),
        ));
        tokio::spawn(run_half(
            "upstream-client",
            upstream_read,
            client_write,
            server,
            closing,
        ));
    }
}

/// Pump bytes from `source` to `destination` until EOF, an I/O error, or the
/// opposite half finishing. Every exit path shuts the destination down and
/// wakes the opposite half so both sockets close promptly.
async fn run_half<R, W>(
    name: &'static str,
    mut source: R,
    mut destination: W,
    server: Arc<Server>,
    closing: Arc<Notify>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    server.increment_opened_conn();
    let byte_rate = RateCounter::new(format!("[{name}] byteRate"));
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = closing.notified() => {
                debug!("closing [{name}] after its peer half finished");
                break;
            }
            read = source.read(&mut buffer) => match read {
                Ok(0) => {
                    debug!("closing [{name}] at end of stream");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = destination.write_all(&buffer[..n]).await {
                        debug!("closing [{name}] after write error: {e}");
                        break;
                    }
                    if let Err(e) = destination.flush().await {
                        debug!("closing [{name}] after flush error: {e}");
                        break;
                    }
                    byte_rate.increment_by(n as u64);
                    server.increment_byte_rate_by(n as u64);
                }
                Err(e) => {
                    debug!("closing [{name}] after read error: {e}");
                    break;
                }
            }
        }
    }

    if let Err(e) = destination.shutdown().await {
        debug!("error shutting down [{name}] destination: {e}");
    }
    closing.notify_one();
    server.increment_closed_conn();
    debug!("{}", byte_rate.summary());
}
