use crate::relay::RelayError;
use sshtunnel_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to bind to {address}: {source}\n\nTroubleshooting:\n  - Check if another process is using this port: lsof -i :{port}\n  - Try using a different local port")]
    Bind {
        address: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept local connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Failed to establish transport to gateway {gateway}: {source}")]
    Transport {
        gateway: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to open forwarded stream to {target}: {source}")]
    Forward {
        target: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Session cancelled by shutdown")]
    Cancelled,
}
