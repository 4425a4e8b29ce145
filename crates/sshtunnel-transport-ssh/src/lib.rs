//! SSH transport implementation
//!
//! Implements the `sshtunnel-transport` traits on top of `russh`. Every call to
//! [`SshConnector::connect`] performs a full handshake and public-key
//! authentication against the gateway; forwarded streams are `direct-tcpip`
//! channels on that connection.

mod config;
mod connection;

pub use config::{decode_key_material, HostKeyPolicy, SshConfig};
pub use connection::{SshConnection, SshConnector};
