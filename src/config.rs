//! Command-line and config-file settings
//!
//! Every setting can come from a flag, an `SSHTUNNEL_*` environment variable or
//! the optional YAML file. Flags and environment variables win over the file.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use sshtunnel_proxy::{TunnelConfig, DEFAULT_LOCAL_HOST};
use sshtunnel_transport_ssh::{HostKeyPolicy, SshConfig};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_SSH_KEY: &str = "~/.ssh/id_rsa";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Forward a local TCP port to a remote host through an SSH gateway
#[derive(Parser, Debug)]
#[command(name = "sshtunnel")]
#[command(about = "Forward a local TCP port to a remote host through an SSH gateway")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Listens on a local port and forwards every accepted connection to
REMOTE_ADDR:REMOTE_PORT as seen from the SSH gateway. Each connection
gets its own SSH session.

EXAMPLES:
  # Reach a private PostgreSQL through a bastion
  sshtunnel --ssh-host bastion.example.com --ssh-user deploy \
    --local-port 5433 \
    --remote-addr db.internal --remote-port 5432

  # Load settings from a file, override the local port
  sshtunnel --config tunnel.yaml --local-port 6000

  # Pin the gateway host key
  sshtunnel --config tunnel.yaml \
    --host-key-fingerprint SHA256:R+902jIbdMnqsJDSYq8s4TtCnqlH7u4nZMiUL3dkjis

ENVIRONMENT VARIABLES:
  SSHTUNNEL_REMOTE_ADDR          Target host, resolved by the gateway
  SSHTUNNEL_REMOTE_PORT          Target port
  SSHTUNNEL_LOCAL_HOST           Local bind host (default: localhost)
  SSHTUNNEL_LOCAL_PORT           Local bind port (0 picks a free port)
  SSHTUNNEL_SSH_HOST             SSH gateway host
  SSHTUNNEL_SSH_PORT             SSH gateway port (default: 22)
  SSHTUNNEL_SSH_USER             SSH user
  SSHTUNNEL_SSH_KEY              Private key path (default: ~/.ssh/id_rsa)
  SSHTUNNEL_SSH_KEY_PASSPHRASE   Passphrase for an encrypted key
  SSHTUNNEL_HOST_KEY_FINGERPRINT Expected gateway host key (SHA256)
"#)]
pub struct Args {
    /// Target host as resolved by the gateway (e.g., db.internal)
    #[arg(long, env = "SSHTUNNEL_REMOTE_ADDR")]
    pub remote_addr: Option<String>,

    /// Target port
    #[arg(long, env = "SSHTUNNEL_REMOTE_PORT")]
    pub remote_port: Option<u16>,

    /// Local host to bind (default: localhost)
    #[arg(long, env = "SSHTUNNEL_LOCAL_HOST")]
    pub local_host: Option<String>,

    /// Local port to bind (0 picks a free port)
    #[arg(long, env = "SSHTUNNEL_LOCAL_PORT")]
    pub local_port: Option<u16>,

    /// SSH gateway host
    #[arg(long, env = "SSHTUNNEL_SSH_HOST")]
    pub ssh_host: Option<String>,

    /// SSH gateway port (default: 22)
    #[arg(long, env = "SSHTUNNEL_SSH_PORT")]
    pub ssh_port: Option<u16>,

    /// SSH user
    #[arg(long, env = "SSHTUNNEL_SSH_USER")]
    pub ssh_user: Option<String>,

    /// Private key file (default: ~/.ssh/id_rsa)
    #[arg(long, env = "SSHTUNNEL_SSH_KEY")]
    pub ssh_key: Option<PathBuf>,

    /// Passphrase for an encrypted private key
    #[arg(long, env = "SSHTUNNEL_SSH_KEY_PASSPHRASE", hide_env_values = true)]
    pub ssh_key_passphrase: Option<String>,

    /// Expected SHA256 fingerprint of the gateway host key
    /// If omitted, any host key is accepted
    #[arg(long, env = "SSHTUNNEL_HOST_KEY_FINGERPRINT")]
    pub host_key_fingerprint: Option<String>,

    /// Seconds allowed for dial, handshake and auth (0 = no limit)
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Seconds between SSH keepalives (0 = disabled)
    #[arg(long)]
    pub keepalive_interval: Option<u64>,

    /// Seconds to wait for open sessions after shutdown (0 = exit immediately)
    #[arg(long)]
    pub drain_timeout: Option<u64>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Local listener and target
    #[serde(default)]
    pub tunnel: TunnelSection,

    /// SSH gateway
    #[serde(default)]
    pub ssh: SshSection,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Private key path, `~` is expanded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,

    /// Environment variable holding the key passphrase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_passphrase_env: Option<String>,

    /// Direct key passphrase (prefer using key_passphrase_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_interval_secs: Option<u64>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn non_zero_secs(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

/// Fully merged settings
pub struct Settings {
    pub remote_addr: String,
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key: PathBuf,
    pub ssh_key_passphrase: Option<String>,
    pub host_key_policy: HostKeyPolicy,
    pub connect_timeout: Option<Duration>,
    pub keepalive_interval: Option<Duration>,
    pub drain_timeout: Option<Duration>,
    pub log_level: String,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("remote", &format_args!("{}:{}", self.remote_addr, self.remote_port))
            .field("local", &format_args!("{}:{}", self.local_host, self.local_port))
            .field("gateway", &format_args!("{}@{}:{}", self.ssh_user, self.ssh_host, self.ssh_port))
            .field("ssh_key", &self.ssh_key)
            .field("ssh_key_passphrase", &self.ssh_key_passphrase.as_ref().map(|_| "<redacted>"))
            .field("host_key_policy", &self.host_key_policy)
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("drain_timeout", &self.drain_timeout)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Settings {
    /// Merge CLI args with the config file, giving precedence to CLI args
    pub fn resolve(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };
        Self::merge(args, file)
    }

    fn merge(args: Args, file: ConfigFile) -> Result<Self> {
        let ConfigFile {
            tunnel,
            ssh,
            drain_timeout_secs,
            log_level,
        } = file;

        let file_passphrase = match &ssh.key_passphrase_env {
            Some(var) => Some(
                std::env::var(var)
                    .with_context(|| format!("Environment variable {} not set", var))?,
            ),
            None => ssh.key_passphrase,
        };

        let remote_addr = args.remote_addr.or(tunnel.remote_addr).ok_or_else(|| {
            anyhow::anyhow!("Remote address is required (use --remote-addr or config file)")
        })?;
        let remote_port = args.remote_port.or(tunnel.remote_port).ok_or_else(|| {
            anyhow::anyhow!("Remote port is required (use --remote-port or config file)")
        })?;
        let local_port = args.local_port.or(tunnel.local_port).ok_or_else(|| {
            anyhow::anyhow!("Local port is required (use --local-port or config file)")
        })?;
        let ssh_host = args.ssh_host.or(ssh.host).ok_or_else(|| {
            anyhow::anyhow!("SSH host is required (use --ssh-host or config file)")
        })?;
        let ssh_user = args.ssh_user.or(ssh.user).ok_or_else(|| {
            anyhow::anyhow!("SSH user is required (use --ssh-user or config file)")
        })?;

        let ssh_key = args
            .ssh_key
            .or(ssh.key)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SSH_KEY));

        let host_key_policy = match args.host_key_fingerprint.or(ssh.host_key_fingerprint) {
            Some(fingerprint) => HostKeyPolicy::Fingerprint(fingerprint),
            None => HostKeyPolicy::AcceptAll,
        };

        Ok(Self {
            remote_addr,
            remote_port,
            local_host: args
                .local_host
                .or(tunnel.local_host)
                .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string()),
            local_port,
            ssh_host,
            ssh_port: args.ssh_port.or(ssh.port).unwrap_or(DEFAULT_SSH_PORT),
            ssh_user,
            ssh_key: expand_tilde(&ssh_key),
            ssh_key_passphrase: args.ssh_key_passphrase.or(file_passphrase),
            host_key_policy,
            connect_timeout: non_zero_secs(args.connect_timeout.or(ssh.connect_timeout_secs)),
            keepalive_interval: non_zero_secs(
                args.keepalive_interval.or(ssh.keepalive_interval_secs),
            ),
            drain_timeout: non_zero_secs(args.drain_timeout.or(drain_timeout_secs)),
            log_level: args
                .log_level
                .or(log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }

    /// Read the key file and build the tunnel configuration
    pub fn tunnel_config(&self) -> Result<TunnelConfig> {
        let ssh_key = fs::read(&self.ssh_key)
            .with_context(|| format!("Failed to read SSH key: {}", self.ssh_key.display()))?;

        let config = TunnelConfig {
            remote_addr: self.remote_addr.clone(),
            remote_port: self.remote_port,
            local_host: self.local_host.clone(),
            local_port: self.local_port,
            ssh_host: self.ssh_host.clone(),
            ssh_port: self.ssh_port,
            ssh_user: self.ssh_user.clone(),
            ssh_key,
        };
        config.validate().context("Invalid tunnel configuration")?;
        Ok(config)
    }

    /// Parse the key material in `tunnel` into an SSH client config
    pub fn ssh_config(&self, tunnel: &TunnelConfig) -> Result<SshConfig> {
        let config = SshConfig::from_key_material(
            tunnel.ssh_user.clone(),
            &tunnel.ssh_key,
            self.ssh_key_passphrase.as_deref(),
        )
        .with_context(|| format!("Failed to load SSH key: {}", self.ssh_key.display()))?;

        Ok(config
            .with_host_key_policy(self.host_key_policy.clone())
            .with_connect_timeout(self.connect_timeout)
            .with_keepalive_interval(self.keepalive_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FIXTURE_KEY: &[u8] =
        include_bytes!("../crates/sshtunnel-transport-ssh/tests/fixtures/id_ed25519");

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["sshtunnel"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    fn full_args() -> Args {
        args(&[
            "--remote-addr",
            "db.internal",
            "--remote-port",
            "5432",
            "--local-port",
            "5433",
            "--ssh-host",
            "bastion.example.com",
            "--ssh-user",
            "deploy",
            "--ssh-key",
            "/keys/id_ed25519",
        ])
    }

    #[test]
    fn test_cli_only_with_defaults() {
        let settings = Settings::merge(full_args(), ConfigFile::default()).unwrap();

        assert_eq!(settings.remote_addr, "db.internal");
        assert_eq!(settings.remote_port, 5432);
        assert_eq!(settings.local_host, "localhost");
        assert_eq!(settings.local_port, 5433);
        assert_eq!(settings.ssh_port, 22);
        assert_eq!(settings.ssh_key, PathBuf::from("/keys/id_ed25519"));
        assert!(matches!(settings.host_key_policy, HostKeyPolicy::AcceptAll));
        assert_eq!(settings.connect_timeout, None);
        assert_eq!(settings.keepalive_interval, None);
        assert_eq!(settings.drain_timeout, None);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_missing_required_value() {
        let err = Settings::merge(
            args(&["--remote-addr", "db.internal", "--remote-port", "5432"]),
            ConfigFile::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Local port is required"));
    }

    #[test]
    fn test_file_values_fill_gaps_and_cli_wins() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
tunnel:
  local_host: 0.0.0.0
  local_port: 7000
  remote_addr: cache.internal
  remote_port: 6379
ssh:
  host: gateway.example.com
  port: 2222
  user: ops
  key: /etc/sshtunnel/key
  host_key_fingerprint: SHA256:abc
  connect_timeout_secs: 10
  keepalive_interval_secs: 0
drain_timeout_secs: 5
log_level: debug
"#,
        )
        .unwrap();

        let settings = Settings::merge(args(&["--local-port", "7001"]), file).unwrap();

        assert_eq!(settings.local_port, 7001);
        assert_eq!(settings.local_host, "0.0.0.0");
        assert_eq!(settings.remote_addr, "cache.internal");
        assert_eq!(settings.ssh_port, 2222);
        assert_eq!(settings.ssh_user, "ops");
        assert_eq!(settings.ssh_key, PathBuf::from("/etc/sshtunnel/key"));
        assert!(matches!(
            settings.host_key_policy,
            HostKeyPolicy::Fingerprint(ref f) if f == "SHA256:abc"
        ));
        assert_eq!(settings.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(settings.keepalive_interval, None);
        assert_eq!(settings.drain_timeout, Some(Duration::from_secs(5)));
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tunnel.yaml");
        fs::write(&path, "ssh:\n  hostname: typo.example.com\n").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_resolve_reads_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tunnel.yaml");
        fs::write(
            &path,
            r#"
tunnel:
  local_port: 0
  remote_addr: db.internal
  remote_port: 5432
ssh:
  host: bastion
  user: deploy
"#,
        )
        .unwrap();

        let settings = Settings::resolve(args(&["--config", path.to_str().unwrap()])).unwrap();
        assert_eq!(settings.local_port, 0);
        assert_eq!(settings.ssh_host, "bastion");
    }

    #[test]
    fn test_missing_config_file() {
        let err = Settings::resolve(args(&["--config", "/nonexistent/tunnel.yaml"])).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_passphrase_from_named_env_var() {
        std::env::set_var("SSHTUNNEL_TEST_KEY_PASSPHRASE", "hunter2");
        let file: ConfigFile =
            serde_yaml::from_str("ssh:\n  key_passphrase_env: SSHTUNNEL_TEST_KEY_PASSPHRASE\n")
                .unwrap();

        let settings = Settings::merge(full_args(), file).unwrap();
        assert_eq!(settings.ssh_key_passphrase.as_deref(), Some("hunter2"));

        std::env::remove_var("SSHTUNNEL_TEST_KEY_PASSPHRASE");
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(
            expand_tilde(Path::new("/etc/key")),
            PathBuf::from("/etc/key")
        );
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_tilde(Path::new("~/.ssh/id_rsa")),
                home.join(".ssh/id_rsa")
            );
        }
    }

    #[test]
    fn test_tunnel_and_ssh_config_from_key_file() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("id_ed25519");
        fs::write(&key_path, FIXTURE_KEY).unwrap();

        let mut settings = Settings::merge(full_args(), ConfigFile::default()).unwrap();
        settings.ssh_key = key_path;
        settings.connect_timeout = Some(Duration::from_secs(3));

        let tunnel = settings.tunnel_config().unwrap();
        assert_eq!(tunnel.ssh_key, FIXTURE_KEY);
        assert_eq!(tunnel.listen_address(), "localhost:5433");

        let ssh = settings.ssh_config(&tunnel).unwrap();
        assert_eq!(ssh.user, "deploy");
        assert_eq!(ssh.connect_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_unreadable_key_file() {
        let mut settings = Settings::merge(full_args(), ConfigFile::default()).unwrap();
        settings.ssh_key = PathBuf::from("/nonexistent/id_rsa");

        let err = settings.tunnel_config().unwrap_err();
        assert!(err.to_string().contains("Failed to read SSH key"));
    }

    #[test]
    fn test_garbage_key_file() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("id_rsa");
        fs::write(&key_path, "not a key").unwrap();

        let mut settings = Settings::merge(full_args(), ConfigFile::default()).unwrap();
        settings.ssh_key = key_path;

        let tunnel = settings.tunnel_config().unwrap();
        let err = settings.ssh_config(&tunnel).unwrap_err();
        assert!(err.to_string().contains("Failed to load SSH key"));
    }
}
