//! Error types for the tunnel keeper.
//!
//! Errors are split by layer:
//!
//! - [`TransportError`]: a single invocation of the transport binary failed.
//! - [`IdentityError`]: the machine descriptor commands failed or returned
//!   output that could not be parsed.
//! - [`TunnelError`]: a tunnel operation failed. Every variant is recoverable
//!   and contained within the tunnel; the next monitor cycle is the retry.
//! - [`StartupError`]: invalid command-line targets. These are the only
//!   process-fatal errors.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command exited with status {}: {stderr}", exit_label(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("failed to run transport command: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl TransportError {
    /// Whether the failure was the timeout bound rather than the remote side
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unexpected output from `{command}`: {output:?}")]
    Malformed { command: String, output: String },
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("{host} is unreachable")]
    Unreachable { host: String },

    #[error("failed to fetch machine identity from {host}: {source}")]
    IdentityFetchFailed {
        host: String,
        #[source]
        source: IdentityError,
    },

    #[error("forwarding process for {forward} exited on its own ({status})")]
    SubprocessDied { forward: String, status: String },

    #[error("failed to spawn forward {forward}: {source}")]
    SpawnFailed {
        forward: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartupError {
    #[error("invalid target `{spec}`: expected localPort:host[:remotePort]")]
    InvalidSpec { spec: String },

    #[error("invalid port `{value}` in target `{spec}`")]
    InvalidPort { spec: String, value: String },

    #[error("local port {port} is privileged; use a port of 1024 or above")]
    PrivilegedPort { port: u16 },

    #[error("local port {port} is used by more than one target")]
    DuplicatePort { port: u16 },

    #[error("local port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("no targets given")]
    NoTargets,
}
