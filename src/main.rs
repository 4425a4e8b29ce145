//! sshtunnel - forward a local TCP port through an SSH gateway
//!
//! Equivalent to `ssh -N -L local_port:remote_addr:remote_port user@ssh_host`,
//! with one SSH session per accepted connection.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Args, Settings};
use sshtunnel_proxy::{ShutdownSignal, TunnelServer};
use sshtunnel_transport_ssh::{HostKeyPolicy, SshConnector};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn note_signal(shutdown: &ShutdownSignal, signal: &str) {
    if shutdown.is_cancelled() {
        warn!(signal, "Shutdown already in progress, ignoring signal");
    } else {
        info!(signal, "Received signal, shutting down...");
        shutdown.cancel();
    }
}

/// Fire `shutdown` on SIGINT or SIGTERM; later signals are only logged
#[cfg(unix)]
async fn watch_signals(shutdown: ShutdownSignal) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        note_signal(&shutdown, name);
    }
}

#[cfg(not(unix))]
async fn watch_signals(shutdown: ShutdownSignal) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        note_signal(&shutdown, "Ctrl+C");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::resolve(args).context("Failed to build tunnel configuration")?;

    // Setup logging before touching the key or the network
    setup_logging(&settings.log_level)?;

    info!(version = env!("GIT_TAG"), "sshtunnel starting...");

    let tunnel = settings.tunnel_config()?;
    let ssh = settings.ssh_config(&tunnel)?;

    info!("Gateway: {}@{}:{}", tunnel.ssh_user, tunnel.ssh_host, tunnel.ssh_port);
    info!("Target: {}", tunnel.target());
    info!("SSH key: {}", settings.ssh_key.display());
    if matches!(ssh.host_key_policy, HostKeyPolicy::AcceptAll) {
        warn!("⚠️  Host key verification disabled (use --host-key-fingerprint to pin it)");
    }

    let server = TunnelServer::bind(&tunnel, SshConnector::new(ssh))
        .await
        .context("Failed to start tunnel")?;
    let sessions = server.sessions();

    info!(
        "Forwarding {} -> {} via {}",
        server.local_addr(),
        tunnel.target(),
        tunnel.gateway()
    );

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_signals(shutdown.clone()).await {
                error!("Failed to install signal handlers: {}", e);
                shutdown.cancel();
            }
        });
    }

    server.run(shutdown).await.context("Tunnel failed")?;

    match settings.drain_timeout {
        Some(grace) => {
            info!(
                "Waiting up to {}s for {} open session(s)",
                grace.as_secs(),
                sessions.active()
            );
            let aborted = sessions.drain(grace).await;
            if aborted > 0 {
                warn!("Aborted {} session(s) still open after drain timeout", aborted);
            }
        }
        None => {
            let open = sessions.active();
            if open > 0 {
                info!("Exiting with {} session(s) still closing", open);
            }
            sessions.abort_all();
        }
    }

    info!("sshtunnel stopped");
    Ok(())
}
