//! One accepted local connection through to its forwarded stream

use crate::error::TunnelError;
use crate::relay::{relay, Direction, RelayError};
use sshtunnel_transport::{Endpoint, TransportConnection, TransportConnector};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bytes moved by a session whose relays ran to completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub bytes_to_remote: u64,
    pub bytes_to_local: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    RelayFinished,
    ForwardFailed,
    Shutdown,
    Completed,
}

/// Sole owner of the session's teardown
///
/// Relays and the shutdown watcher never touch the endpoints themselves; they
/// ask the closer, which fires `closed` and closes the transport exactly once.
/// Relay tasks drop their stream halves as soon as `closed` fires.
#[derive(Debug)]
struct SessionCloser<T: TransportConnection> {
    transport: Arc<T>,
    closed: CancellationToken,
    reason: OnceLock<CloseReason>,
}

impl<T: TransportConnection> SessionCloser<T> {
    fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            closed: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    async fn close(&self, reason: CloseReason) {
        if self.reason.set(reason).is_err() {
            return;
        }
        debug!(
            ?reason,
            connection_id = %self.transport.connection_id(),
            "closing session endpoints"
        );
        self.closed.cancel();
        self.transport.close().await;
    }

    fn reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }
}

enum RelayOutcome {
    Finished(Result<u64, RelayError>),
    Interrupted,
}

async fn relay_until_closed<R, W, T>(
    direction: Direction,
    mut source: R,
    mut destination: W,
    closer: Arc<SessionCloser<T>>,
) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: TransportConnection,
{
    let outcome = tokio::select! {
        result = relay(direction, &mut source, &mut destination) => RelayOutcome::Finished(result),
        _ = closer.closed.cancelled() => RelayOutcome::Interrupted,
    };

    match &outcome {
        RelayOutcome::Finished(Ok(bytes)) => {
            debug!(%direction, bytes, "relay reached EOF");
        }
        RelayOutcome::Finished(Err(e)) => {
            debug!(%direction, error = %e, "relay failed");
        }
        RelayOutcome::Interrupted => {
            debug!(%direction, "relay interrupted by session close");
        }
    }

    if matches!(outcome, RelayOutcome::Finished(_)) {
        closer.close(CloseReason::RelayFinished).await;
    }

    outcome
}

/// Run one tunnel session to completion
///
/// Dials `gateway`, opens a forwarded stream to `target` and relays bytes
/// between it and `local` until one direction ends or `shutdown` fires. The
/// local stream and the transport are closed on every return path.
pub async fn run_session<C, S>(
    local: S,
    gateway: &Endpoint,
    target: &Endpoint,
    connector: &C,
    shutdown: CancellationToken,
) -> Result<SessionStats, TunnelError>
where
    C: TransportConnector,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let transport = tokio::select! {
        result = connector.connect(gateway) => result.map_err(|source| TunnelError::Transport {
            gateway: gateway.to_string(),
            source,
        })?,
        _ = shutdown.cancelled() => return Err(TunnelError::Cancelled),
    };
    let transport = Arc::new(transport);
    let closer = Arc::new(SessionCloser::new(transport.clone()));

    debug!(
        connection_id = %transport.connection_id(),
        gateway = %gateway,
        "transport established"
    );

    let watcher = {
        let closer = closer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => closer.close(CloseReason::Shutdown).await,
                _ = closer.closed.cancelled() => {}
            }
        })
    };

    let remote = tokio::select! {
        result = transport.open_forwarded(target) => match result {
            Ok(stream) => stream,
            Err(source) => {
                closer.close(CloseReason::ForwardFailed).await;
                let _ = watcher.await;
                return Err(TunnelError::Forward {
                    target: target.to_string(),
                    source,
                });
            }
        },
        _ = closer.closed.cancelled() => {
            let _ = watcher.await;
            return Err(TunnelError::Cancelled);
        }
    };

    debug!(target = %target, "forwarded stream open");

    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let outbound = tokio::spawn(relay_until_closed(
        Direction::LocalToRemote,
        local_read,
        remote_write,
        closer.clone(),
    ));
    let inbound = tokio::spawn(relay_until_closed(
        Direction::RemoteToLocal,
        remote_read,
        local_write,
        closer.clone(),
    ));

    let (outbound, inbound) = tokio::join!(outbound, inbound);
    closer.close(CloseReason::Completed).await;
    let _ = watcher.await;

    let mut stats = SessionStats::default();
    let mut relay_error = None;
    let mut interrupted = false;

    for (direction, joined) in [
        (Direction::LocalToRemote, outbound),
        (Direction::RemoteToLocal, inbound),
    ] {
        match joined {
            Ok(RelayOutcome::Finished(Ok(bytes))) => match direction {
                Direction::LocalToRemote => stats.bytes_to_remote = bytes,
                Direction::RemoteToLocal => stats.bytes_to_local = bytes,
            },
            Ok(RelayOutcome::Finished(Err(e))) => {
                relay_error.get_or_insert(e);
            }
            Ok(RelayOutcome::Interrupted) => interrupted = true,
            Err(e) => {
                warn!(%direction, error = %e, "relay task panicked");
                interrupted = true;
            }
        }
    }

    if let Some(e) = relay_error {
        return Err(TunnelError::Relay(e));
    }
    if interrupted && closer.reason() == Some(CloseReason::Shutdown) {
        return Err(TunnelError::Cancelled);
    }

    Ok(stats)
}
