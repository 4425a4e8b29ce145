//! Local-to-remote TCP tunnel core
//!
//! Listens on a local port and, for every accepted connection, dials a fresh
//! transport to the gateway, opens a forwarded stream to the target and relays
//! bytes both ways until either side closes or shutdown is requested.

mod config;
mod error;
mod relay;
mod server;
mod session;
mod task_tracker;

pub use config::{TunnelConfig, DEFAULT_LOCAL_HOST};
pub use error::TunnelError;
pub use relay::{relay, Direction, RelayError};
pub use server::{run, SessionIdGenerator, TunnelServer};
pub use session::{run_session, SessionStats};
pub use task_tracker::SessionTracker;

/// One-shot, multi-observer shutdown broadcast
///
/// Firing is idempotent and a fired signal stays fired. Per-session signals are
/// derived with [`CancellationToken::child_token`].
pub use tokio_util::sync::CancellationToken as ShutdownSignal;
