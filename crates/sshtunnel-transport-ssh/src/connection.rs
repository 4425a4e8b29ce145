//! SSH connector and connection

use async_trait::async_trait;
use russh::keys::{Algorithm, HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{client, ChannelStream, Disconnect};
use sshtunnel_transport::{
    CloseFlag, Endpoint, TransportConnection, TransportConnector, TransportError,
    TransportResult,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{HostKeyPolicy, SshConfig};

/// russh callback handler
struct Handler {
    policy: HostKeyPolicy,
    gateway: String,
}

impl client::Handler for Handler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted = self.policy.verify(server_public_key);
        if !accepted {
            warn!(
                gateway = %self.gateway,
                policy = %self.policy,
                "gateway host key does not match the configured fingerprint"
            );
        }
        Ok(accepted)
    }
}

fn is_rsa(key: &PrivateKey) -> bool {
    matches!(key.algorithm(), Algorithm::Rsa { .. })
}

/// Pair `key` with the signature hash to authenticate with
///
/// `server_rsa_hash` is what the gateway advertised in `server-sig-algs`:
/// `Some(Some(_))` for an `rsa-sha2-*` algorithm, `Some(None)` for legacy
/// `ssh-rsa` only, `None` when nothing was advertised. Non-RSA keys ignore it.
fn signing_key(
    key: Arc<PrivateKey>,
    server_rsa_hash: Option<Option<HashAlg>>,
) -> PrivateKeyWithHashAlg {
    let hash = if is_rsa(&key) {
        server_rsa_hash.flatten()
    } else {
        None
    };
    PrivateKeyWithHashAlg::new(key, hash)
}

/// Dials a fresh authenticated SSH connection per call
#[derive(Debug, Clone)]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    async fn dial(&self, gateway: &Endpoint) -> TransportResult<client::Handle<Handler>> {
        let client_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.config.keepalive_interval,
            ..Default::default()
        });

        let handler = Handler {
            policy: self.config.host_key_policy.clone(),
            gateway: gateway.to_string(),
        };

        let mut handle = client::connect(
            client_config,
            (gateway.host.as_str(), gateway.port),
            handler,
        )
        .await
        .map_err(|e| match e {
            russh::Error::UnknownKey => TransportError::HostKeyRejected(gateway.to_string()),
            other => TransportError::ConnectionError(format!(
                "SSH connect to {} failed: {}",
                gateway, other
            )),
        })?;

        debug!(gateway = %gateway, "SSH handshake complete");

        let server_rsa_hash = if is_rsa(&self.config.key) {
            handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| TransportError::ConnectionError(e.to_string()))?
        } else {
            None
        };
        let key = signing_key(self.config.key.clone(), server_rsa_hash);
        let result = handle
            .authenticate_publickey(self.config.user.as_str(), key)
            .await
            .map_err(|e| TransportError::AuthenticationFailed(e.to_string()))?;

        if !result.success() {
            return Err(TransportError::AuthenticationFailed(format!(
                "public key rejected for user {}",
                self.config.user
            )));
        }

        Ok(handle)
    }
}

#[async_trait]
impl TransportConnector for SshConnector {
    type Connection = SshConnection;

    async fn connect(&self, gateway: &Endpoint) -> TransportResult<Self::Connection> {
        let handle = match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.dial(gateway))
                .await
                .map_err(|_| TransportError::Timeout)??,
            None => self.dial(gateway).await?,
        };

        let connection = SshConnection {
            id: uuid::Uuid::new_v4().to_string(),
            gateway: gateway.clone(),
            handle,
            closed: CloseFlag::new(),
        };

        info!(
            connection_id = %connection.id,
            gateway = %gateway,
            user = %self.config.user,
            "SSH connection established"
        );

        Ok(connection)
    }

    fn name(&self) -> &str {
        "SSH"
    }
}

/// An authenticated SSH connection to the gateway
pub struct SshConnection {
    id: String,
    gateway: Endpoint,
    handle: client::Handle<Handler>,
    closed: CloseFlag,
}

impl fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConnection")
            .field("id", &self.id)
            .field("gateway", &self.gateway)
            .field("closed", &self.closed.is_closed())
            .finish()
    }
}

#[async_trait]
impl TransportConnection for SshConnection {
    type Stream = ChannelStream<client::Msg>;

    async fn open_forwarded(&self, target: &Endpoint) -> TransportResult<Self::Stream> {
        if self.closed.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let channel = self
            .handle
            .channel_open_direct_tcpip(target.host.clone(), u32::from(target.port), "127.0.0.1", 0)
            .await
            .map_err(|e| TransportError::ChannelOpenFailed {
                target: target.to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            connection_id = %self.id,
            target = %target,
            "direct-tcpip channel opened"
        );

        Ok(channel.into_stream())
    }

    async fn close(&self) {
        if !self.closed.mark_closed() {
            return;
        }

        // The peer may already have dropped the connection; nothing to report then.
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(connection_id = %self.id, error = %e, "SSH disconnect after close");
        } else {
            debug!(connection_id = %self.id, "SSH connection closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    fn connection_id(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SshConfig;
    use tokio::net::TcpListener;

    const TEST_KEY: &str = include_str!("../tests/fixtures/id_ed25519");
    const TEST_RSA_KEY: &str = include_str!("../tests/fixtures/id_rsa");

    fn connector() -> SshConnector {
        SshConnector::new(SshConfig::from_key_material("ivan", TEST_KEY.as_bytes(), None).unwrap())
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Grab a free port and release it so nothing is listening there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connector()
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionError(_)), "{err}");
    }

    #[tokio::test]
    async fn test_connect_timeout_against_silent_gateway() {
        // Accepts TCP but never speaks SSH.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let connector = SshConnector::new(
            connector()
                .config()
                .clone()
                .with_connect_timeout(Some(std::time::Duration::from_millis(200))),
        );

        let err = connector
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[test]
    fn test_rsa_key_signs_with_advertised_sha2() {
        let key = Arc::new(crate::decode_key_material(TEST_RSA_KEY.as_bytes(), None).unwrap());

        let signing = signing_key(key.clone(), Some(Some(HashAlg::Sha512)));
        assert_eq!(signing.algorithm().to_string(), "rsa-sha2-512");

        let signing = signing_key(key.clone(), Some(Some(HashAlg::Sha256)));
        assert_eq!(signing.algorithm().to_string(), "rsa-sha2-256");

        // Only fall back to ssh-rsa when the gateway offers nothing better
        let signing = signing_key(key, Some(None));
        assert_eq!(signing.algorithm().to_string(), "ssh-rsa");
    }

    #[test]
    fn test_ed25519_key_ignores_rsa_hash() {
        let key = Arc::new(crate::decode_key_material(TEST_KEY.as_bytes(), None).unwrap());
        assert!(!is_rsa(&key));

        let signing = signing_key(key, Some(Some(HashAlg::Sha512)));
        assert_eq!(signing.algorithm().to_string(), "ssh-ed25519");
    }

    #[test]
    fn test_connector_name() {
        assert_eq!(connector().name(), "SSH");
    }
}
