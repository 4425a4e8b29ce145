//! SSH client configuration

use russh::keys::{HashAlg, PrivateKey, PublicKey};
use sshtunnel_transport::{TransportError, TransportResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How to handle the gateway's host key
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept whatever key the gateway presents
    #[default]
    AcceptAll,
    /// Only accept a key whose SHA256 fingerprint matches (e.g. `SHA256:R+90...`)
    Fingerprint(String),
}

impl HostKeyPolicy {
    pub fn verify(&self, server_public_key: &PublicKey) -> bool {
        match self {
            Self::AcceptAll => true,
            Self::Fingerprint(expected) => {
                let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
                let expected = expected.trim();
                let expected = expected.strip_prefix("SHA256:").unwrap_or(expected);
                actual.strip_prefix("SHA256:").unwrap_or(&actual) == expected
            }
        }
    }
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptAll => write!(f, "accept-all"),
            Self::Fingerprint(fp) => write!(f, "fingerprint {}", fp),
        }
    }
}

/// Decode private key material (OpenSSH or PEM encoded)
pub fn decode_key_material(material: &[u8], passphrase: Option<&str>) -> TransportResult<PrivateKey> {
    let text = std::str::from_utf8(material)
        .map_err(|_| TransportError::KeyError("key material is not valid UTF-8".to_string()))?;

    if text.trim().is_empty() {
        return Err(TransportError::KeyError("key material is empty".to_string()));
    }

    russh::keys::decode_secret_key(text, passphrase)
        .map_err(|e| TransportError::KeyError(e.to_string()))
}

/// Everything needed to dial and authenticate against a gateway
#[derive(Clone)]
pub struct SshConfig {
    pub user: String,
    pub key: Arc<PrivateKey>,
    pub host_key_policy: HostKeyPolicy,
    /// Upper bound on dial + handshake + auth. `None` leaves it to the OS.
    pub connect_timeout: Option<Duration>,
    pub keepalive_interval: Option<Duration>,
}

impl SshConfig {
    pub fn new(user: impl Into<String>, key: PrivateKey) -> Self {
        Self {
            user: user.into(),
            key: Arc::new(key),
            host_key_policy: HostKeyPolicy::default(),
            connect_timeout: None,
            keepalive_interval: None,
        }
    }

    /// Build a config from raw key bytes, failing on unparseable material
    pub fn from_key_material(
        user: impl Into<String>,
        material: &[u8],
        passphrase: Option<&str>,
    ) -> TransportResult<Self> {
        let user = user.into();
        if user.is_empty() {
            return Err(TransportError::ConfigurationError(
                "SSH user cannot be empty".to_string(),
            ));
        }
        Ok(Self::new(user, decode_key_material(material, passphrase)?))
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("user", &self.user)
            .field("key", &"<redacted>")
            .field("host_key_policy", &self.host_key_policy)
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}
