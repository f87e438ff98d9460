//! shunt: TCP load balancer fanning client connections out over replica
//! upstreams, usually the local ends of ssh tunnels to one backend.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shunt::cli::Cli;
use shunt::proxy::TcpProxy;
use shunt::{VERSION, api};

const PROXY_NAME: &str = "shunt";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(1);
    });

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!("{PROXY_NAME} version {VERSION}");

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            let _ = Cli::command().print_help();
            std::process::exit(1);
        }
    };

    let proxy = Arc::new(TcpProxy::new(PROXY_NAME, &config));

    // Status pages on their own listener and task.
    let status_listener = TcpListener::bind(("0.0.0.0", config.status_port))
        .await
        .with_context(|| format!("could not bind status server on port {}", config.status_port))?;
    info!(
        "status pages at http://localhost:{}/stats",
        config.status_port
    );
    let router = api::router(Arc::clone(&proxy));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(status_listener, router).await {
            error!("status server error: {e}");
        }
    });

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("could not bind proxy listener on port {}", config.listen_port))?;
    info!("listening for incoming clients on port {}", config.listen_port);

    let shutdown_proxy = Arc::clone(&proxy);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        shutdown_proxy.stop();
    });

    proxy.run(listener).await;

    Ok(())
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("could not install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
