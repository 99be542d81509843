//! Liveness probing.

use std::time::Duration;

use tracing::debug;

use super::transport::Transport;

/// Remote no-op used to check reachability
pub const PROBE_COMMAND: &str = "true";

/// Run a trivial remote command and report whether `host` answered in time.
///
/// A timeout, a non-zero exit or a failure to run the transport at all are
/// all reported as unreachable; nothing is raised to the caller.
pub async fn ping(transport: &dyn Transport, host: &str, timeout: Duration) -> bool {
    match transport
        .run_remote_command(host, PROBE_COMMAND, timeout)
        .await
    {
        Ok(_) => true,
        Err(e) => {
            debug!(host, ?timeout, "Probe failed: {}", e);
            false
        }
    }
}
