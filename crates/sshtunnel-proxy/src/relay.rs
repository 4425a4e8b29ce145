//! One-directional byte pump

use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalToRemote => write!(f, "local->remote"),
            Self::RemoteToLocal => write!(f, "remote->local"),
        }
    }
}

/// I/O fault in the middle of a copy
#[derive(Debug, Error)]
#[error("Relay {direction} failed after {bytes_copied} bytes: {source}")]
pub struct RelayError {
    pub direction: Direction,
    pub bytes_copied: u64,
    #[source]
    pub source: std::io::Error,
}

/// Copy `source` into `destination` until `source` reaches EOF
///
/// Returns the number of bytes copied. Neither stream is closed here; the
/// caller owns both endpoints and decides when to tear them down.
pub async fn relay<R, W>(
    direction: Direction,
    source: &mut R,
    destination: &mut W,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total_bytes = 0u64;

    let fault = |bytes_copied: u64, source: std::io::Error| RelayError {
        direction,
        bytes_copied,
        source,
    };

    loop {
        let n = match source.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return Err(fault(total_bytes, e)),
        };

        destination
            .write_all(&buffer[..n])
            .await
            .map_err(|e| fault(total_bytes, e))?;
        total_bytes += n as u64;

        trace!(%direction, bytes = n, total_bytes, "relayed chunk");
    }

    destination
        .flush()
        .await
        .map_err(|e| fault(total_bytes, e))?;

    Ok(total_bytes)
}
