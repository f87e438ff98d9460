//! SSH jump-host tunnels and their supervision.
//!
//! Each upstream bound through a jump host owns a [`JumpHostTunnel`]: a
//! supervisor for one `ssh -N -L` child process keeping `localhost:PORT`
//! forwarded to the server behind the jump host. The supervisor respawns the
//! child whenever it exits, backing off exponentially while it keeps failing.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{HostPort, JumpHost};

const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// A child that stayed up at least this long counts as established, resetting
/// the back-off.
const STABLE_CHILD_UPTIME: Duration = Duration::from_secs(60);

/// Build the ssh invocation forwarding `local_port` through the jump host.
///
/// Returns the binary and its argument list, e.g.
/// `ssh -i key -n -N -L 48139:server:8020 -l user -p 22 jumphost`.
#[must_use]
pub fn ssh_command(jumphost: &JumpHost, local_port: i32) -> (String, Vec<String>) {
    let binary = jumphost
        .ssh_binary
        .clone()
        .unwrap_or_else(|| "ssh".to_string());

    let mut args = Vec::new();
    if let Some(credentials) = &jumphost.credentials {
        args.push("-i".to_string());
        args.push(credentials.clone());
    }
    args.push("-n".to_string());
    args.push("-N".to_string());
    let bind = if jumphost.open_interfaces { "*:" } else { "" };
    args.push("-L".to_string());
    args.push(format!(
        "{bind}{local_port}:{}:{}",
        jumphost.server.host, jumphost.server.port
    ));
    if let Some(user) = &jumphost.user {
        args.push("-l".to_string());
        args.push(user.clone());
    }
    if jumphost.sshd.port != HostPort::UNSPECIFIED_PORT {
        args.push("-p".to_string());
        args.push(jumphost.sshd.port.to_string());
    }
    if jumphost.compression {
        args.push("-C".to_string());
    }
    if let Some(ciphers) = &jumphost.ciphers {
        args.push("-c".to_string());
        args.push(ciphers.clone());
    }
    args.push(jumphost.sshd.host.clone());

    (binary, args)
}

/// Supervisor for one ssh tunnel child process.
pub struct JumpHostTunnel {
    binary: String,
    args: Vec<String>,
    local_port: i32,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl JumpHostTunnel {
    #[must_use]
    pub fn new(jumphost: &JumpHost, local_port: i32) -> Self {
        let (binary, args) = ssh_command(jumphost, local_port);
        let (stop_tx, _) = watch::channel(false);
        Self {
            binary,
            args,
            local_port,
            started: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// Spawn the supervision task. Subsequent calls are no-ops, including
    /// after [`stop`](Self::stop).
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let binary = self.binary.clone();
        let args = self.args.clone();
        let local_port = self.local_port;
        let stop_rx = self.stop_tx.subscribe();
        tokio::spawn(supervise(binary, args, local_port, stop_rx));
    }

    /// Kill the child and stop respawning. Idempotent.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// Spawn-wait-respawn loop. Runs until a stop is requested.
async fn supervise(binary: String, args: Vec<String>, local_port: i32, mut stop_rx: watch::Receiver<bool>) {
    let mut backoff = RESTART_BACKOFF_BASE;
    while !*stop_rx.borrow() {
        info!(
            port = local_port,
            "starting ssh tunnel: {binary} {}",
            args.join(" ")
        );

        let spawned = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        match spawned {
            Ok(mut child) => {
                let started_at = Instant::now();
                if let Some(stdout) = child.stdout.take() {
                    tokio::spawn(log_child_output("stdout", stdout, local_port));
                }
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(log_child_output("stderr", stderr, local_port));
                }

                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => warn!(port = local_port, "ssh tunnel exited with {status}"),
                        Err(e) => warn!(port = local_port, "error waiting for ssh tunnel: {e}"),
                    },
                    _ = stop_rx.changed() => {
                        if let Err(e) = child.kill().await {
                            warn!(port = local_port, "failed to kill ssh tunnel: {e}");
                        }
                        break;
                    }
                }

                if started_at.elapsed() >= STABLE_CHILD_UPTIME {
                    backoff = RESTART_BACKOFF_BASE;
                }
            }
            Err(e) => {
                error!(port = local_port, "failed to spawn {binary}: {e}");
            }
        }

        debug!(
            port = local_port,
            "respawning ssh tunnel in {}s",
            backoff.as_secs()
        );
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = stop_rx.changed() => break,
        }
        backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);
    }
    debug!(port = local_port, "ssh tunnel supervisor stopped");
}

/// Forward each line of the child's output into our log.
async fn log_child_output(stream: &'static str, output: impl AsyncRead + Unpin, local_port: i32) {
    let mut lines = BufReader::new(output).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(port = local_port, "ssh {stream}: {line}");
    }
}
