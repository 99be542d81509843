//! Graceful shutdown of the forwards that are up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use super::tunnel::Tunnel;

/// Sends a forward cancel for every connected tunnel, once.
pub struct ShutdownHandler {
    tunnels: Arc<[Arc<Tunnel>]>,
    ran: AtomicBool,
}

impl ShutdownHandler {
    pub fn new(tunnels: Arc<[Arc<Tunnel>]>) -> Self {
        Self {
            tunnels,
            ran: AtomicBool::new(false),
        }
    }

    /// Cancel every tunnel that is `Connected` right now, one at a time.
    ///
    /// Returns the number of cancel requests issued. Failures are logged and
    /// still counted. Calls after the first do nothing and return 0.
    pub async fn run(&self) -> usize {
        if self.ran.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let mut issued = 0;
        for tunnel in self.tunnels.iter() {
            let Some(result) = tunnel.cancel_if_connected().await else {
                continue;
            };
            issued += 1;
            match result {
                Ok(()) => info!(forward = %tunnel.forward(), "Forward cancelled"),
                Err(e) => warn!(forward = %tunnel.forward(), "Failed to cancel forward: {}", e),
            }
        }
        info!(cancelled = issued, "Shutdown handler finished");
        issued
    }
}
