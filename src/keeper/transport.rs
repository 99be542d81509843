//! The transport collaborator.
//!
//! The keeper never speaks SSH itself. Everything that touches the network goes
//! through the [`Transport`] trait, whose production implementation,
//! [`SshTransport`], drives the OpenSSH client binary as a subprocess:
//!
//! - remote commands: `ssh -o BatchMode=yes -o ConnectTimeout=N host command`
//! - forwards: `ssh -N -L local:localhost:remote host`, owning a control socket
//! - cancels: `ssh -O cancel -L local:localhost:remote host` via that socket

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::error::TransportError;
use super::forward::ForwardSpec;

/// Seconds between keepalive messages on a forward
const SERVER_ALIVE_INTERVAL_SECS: u64 = 15;

/// Missed keepalives before the forward process gives up
const SERVER_ALIVE_COUNT_MAX: u32 = 3;

/// A running forward subprocess, exclusively owned by one tunnel.
#[async_trait]
pub trait ForwardProcess: Send {
    /// Non-blocking check of whether the process has exited.
    ///
    /// Returns a description of the exit status once it has.
    fn try_exit_status(&mut self) -> Option<String>;

    /// Forcibly terminate the process and reap it.
    async fn terminate(&mut self);
}

/// Trait for the process-boundary operations the tunnels depend on.
///
/// Implementations must be thread-safe (`Send + Sync`) since every tunnel
/// worker shares one transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command` on `host`, returning its standard output.
    ///
    /// Must return [`TransportError::Timeout`] rather than wait longer than
    /// `timeout`, and [`TransportError::NonZeroExit`] when the command fails.
    async fn run_remote_command(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, TransportError>;

    /// Start the forward described by `forward` without waiting for it to
    /// become usable. Output streams are discarded.
    fn spawn_forward(
        &self,
        forward: &ForwardSpec,
    ) -> Result<Box<dyn ForwardProcess>, TransportError>;

    /// Ask the transport to tear down the forward. Best effort.
    async fn cancel_forward(&self, forward: &ForwardSpec) -> Result<(), TransportError>;
}

/// [`Transport`] backed by the OpenSSH client binary.
pub struct SshTransport {
    binary: String,
    control_dir: PathBuf,
}

impl SshTransport {
    pub fn new(binary: impl Into<String>, control_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            control_dir: control_dir.into(),
        }
    }

    /// Control socket owned by the forward on `local_port`.
    ///
    /// Keyed by local port, which is unique across tunnels, so several
    /// forwards to the same host never share a socket.
    pub(crate) fn control_path(&self, local_port: u16) -> PathBuf {
        self.control_dir
            .join(format!("tunnel-keeper-{}.sock", local_port))
    }

    pub(crate) fn remote_command_args(host: &str, command: &str, timeout: Duration) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", timeout.as_secs().max(1)),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-o".to_string(),
            "ControlPath=none".to_string(),
            "-T".to_string(),
            host.to_string(),
            command.to_string(),
        ]
    }

    pub(crate) fn forward_args(&self, forward: &ForwardSpec) -> Vec<String> {
        vec![
            "-N".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            format!("ServerAliveInterval={}", SERVER_ALIVE_INTERVAL_SECS),
            "-o".to_string(),
            format!("ServerAliveCountMax={}", SERVER_ALIVE_COUNT_MAX),
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path(forward.local_port).display()),
            "-L".to_string(),
            forward.forward_arg(),
            forward.host.clone(),
        ]
    }

    pub(crate) fn cancel_args(&self, forward: &ForwardSpec) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path(forward.local_port).display()),
            "-O".to_string(),
            "cancel".to_string(),
            "-L".to_string(),
            forward.forward_arg(),
            forward.host.clone(),
        ]
    }

    async fn run_with_timeout(
        &self,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out command is dropped with its future, which must kill it
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(TransportError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Time allowed for a shutdown cancel request
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
impl Transport for SshTransport {
    async fn run_remote_command(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        debug!(host, command, ?timeout, "Running remote command");
        self.run_with_timeout(Self::remote_command_args(host, command, timeout), timeout)
            .await
    }

    fn spawn_forward(
        &self,
        forward: &ForwardSpec,
    ) -> Result<Box<dyn ForwardProcess>, TransportError> {
        // ssh refuses to become master on a path that already exists
        let control_path = self.control_path(forward.local_port);
        remove_control_socket(&control_path)?;

        let child = Command::new(&self.binary)
            .args(self.forward_args(forward))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        debug!(%forward, pid = ?child.id(), "Spawned forward process");
        Ok(Box::new(ChildProcess {
            child,
            control_path,
        }))
    }

    async fn cancel_forward(&self, forward: &ForwardSpec) -> Result<(), TransportError> {
        self.run_with_timeout(self.cancel_args(forward), CANCEL_TIMEOUT)
            .await
            .map(|_| ())
    }
}

/// Remove a control socket left behind by a killed forward.
fn remove_control_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// [`ForwardProcess`] wrapping a tokio child process.
struct ChildProcess {
    child: Child,
    control_path: PathBuf,
}

#[async_trait]
impl ForwardProcess for ChildProcess {
    fn try_exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => Some(status.to_string()),
            Err(e) => Some(format!("status check failed: {}", e)),
        }
    }

    async fn terminate(&mut self) {
        // Fails only when the child was already reaped
        if let Err(e) = self.child.kill().await {
            debug!("Forward process already gone: {}", e);
        }
        // SIGKILL leaves the socket file in place
        if let Err(e) = remove_control_socket(&self.control_path) {
            warn!(path = %self.control_path.display(), "Failed to remove control socket: {}", e);
        }
    }
}
