//! Tunnel keeper module maintaining a set of SSH local port forwards.
//!
//! This module is organized into the following submodules:
//!
//! - `forward`: Target parsing and startup validation
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error types for each layer
//! - `transport`: Remote command and forward process collaborator (ssh)
//! - `probe`: Reachability probe
//! - `identity`: Machine identity discovery
//! - `tunnel`: Tunnel entity and its connection state machine
//! - `checker`: Concurrent health checks and the monitor loop
//! - `status`: Status snapshots and the reporter loop
//! - `shutdown`: Forward cancellation on exit
//! - `app`: Orchestration of the loops and shutdown order

pub mod app;
pub mod checker;
pub mod config;
pub mod error;
pub mod forward;
pub mod identity;
pub mod probe;
pub mod shutdown;
pub mod status;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use app::Keeper;
pub use config::{ConfigOverrides, KeeperConfig};
pub use forward::{ForwardSpec, LoopbackPortChecker, validate_targets};
pub use status::StatusFormat;
pub use transport::SshTransport;
