//! Tunnel supervisor
//!
//! Owns the local listener, accepts connections and spawns one session per
//! connection. Each session dials its own transport to the gateway.

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::session::run_session;
use crate::task_tracker::SessionTracker;
use sshtunnel_transport::{Endpoint, TransportConnector};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Session ID generator for logging
#[derive(Clone)]
pub struct SessionIdGenerator {
    next_session_id: Arc<AtomicU64>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound tunnel, ready to accept
pub struct TunnelServer<C: TransportConnector> {
    listener: TcpListener,
    local_addr: SocketAddr,
    gateway: Endpoint,
    target: Endpoint,
    connector: Arc<C>,
    session_ids: SessionIdGenerator,
    sessions: Arc<SessionTracker>,
}

impl<C: TransportConnector> TunnelServer<C> {
    /// Validate `config` and bind the local listen address
    pub async fn bind(config: &TunnelConfig, connector: C) -> Result<Self, TunnelError> {
        config.validate()?;

        let listener = TcpListener::bind((config.local_host.as_str(), config.local_port))
            .await
            .map_err(|source| TunnelError::Bind {
                address: config.listen_address(),
                port: config.local_port,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TunnelError::Bind {
            address: config.listen_address(),
            port: config.local_port,
            source,
        })?;

        info!(
            local_addr = %local_addr,
            gateway = %config.gateway(),
            target = %config.target(),
            transport = connector.name(),
            "Tunnel listening"
        );

        Ok(Self {
            listener,
            local_addr,
            gateway: config.gateway(),
            target: config.target(),
            connector: Arc::new(connector),
            session_ids: SessionIdGenerator::new(),
            sessions: Arc::new(SessionTracker::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle on the live session set; stays valid after `run` returns
    pub fn sessions(&self) -> Arc<SessionTracker> {
        self.sessions.clone()
    }

    /// Accept until `shutdown` fires
    ///
    /// Returns as soon as the accept loop exits. Sessions are not awaited; they
    /// observe the derived session signal and tear themselves down.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TunnelError> {
        let session_shutdown = shutdown.child_token();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested, leaving accept loop");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        self.spawn_session(stream, peer_addr, session_shutdown.clone());
                    }
                    Err(e) => {
                        let e = TunnelError::Accept(e);
                        error!(error = %e, "Accept failed, continuing");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }

        info!(
            local_addr = %self.local_addr,
            active_sessions = self.sessions.active(),
            "Closing listener and broadcasting shutdown to sessions"
        );
        drop(self.listener);
        session_shutdown.cancel();

        info!("Tunnel stopped");
        Ok(())
    }

    fn spawn_session(
        &self,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let session_id = self.session_ids.generate();
        let connector = self.connector.clone();
        let gateway = self.gateway.clone();
        let target = self.target.clone();
        let sessions = self.sessions.clone();

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on local connection");
        }

        // Held until the handle is registered so `finish` always follows `register`
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let span = info_span!("session", session_id, peer_addr = %peer_addr);
        let handle = tokio::spawn(
            async move {
                if registered_rx.await.is_err() {
                    return;
                }
                info!("Accepted local connection");

                match run_session(stream, &gateway, &target, connector.as_ref(), shutdown).await {
                    Ok(stats) => info!(
                        bytes_to_remote = stats.bytes_to_remote,
                        bytes_to_local = stats.bytes_to_local,
                        "Session finished"
                    ),
                    Err(TunnelError::Cancelled) => info!("Session cancelled by shutdown"),
                    Err(e) => warn!(error = %e, "Session failed"),
                }

                sessions.finish(session_id);
            }
            .instrument(span),
        );

        self.sessions.register(session_id, handle);
        let _ = registered_tx.send(());
    }
}

/// Bind `config`'s listen address and run the tunnel until `shutdown` fires
pub async fn run<C: TransportConnector>(
    config: &TunnelConfig,
    connector: C,
    shutdown: CancellationToken,
) -> Result<(), TunnelError> {
    TunnelServer::bind(config, connector)
        .await?
        .run(shutdown)
        .await
}
