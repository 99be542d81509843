//! Concurrent health checking and the monitor loop.
//!
//! [`check_all`] spawns one task per tunnel and joins them all, so a slow
//! probe on one host never delays another. [`run_monitor`] repeats it on a
//! fixed interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::TunnelError;
use super::forward::ForwardSpec;
use super::tunnel::{RefreshOutcome, Tunnel};

/// Result of one tunnel's refresh within a check
#[derive(Debug)]
pub struct CheckResult {
    pub forward: ForwardSpec,
    /// `None` if the worker task itself failed (panicked)
    pub outcome: Option<Result<RefreshOutcome, TunnelError>>,
}

/// Refresh every tunnel in parallel and wait for all of them.
///
/// Results come back in the order of `tunnels`. Failures stay inside their
/// result and never affect other tunnels.
pub async fn check_all(tunnels: &[Arc<Tunnel>]) -> Vec<CheckResult> {
    let started = Instant::now();

    let workers: Vec<_> = tunnels
        .iter()
        .map(|tunnel| {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.refresh().await })
        })
        .collect();

    let results: Vec<CheckResult> = join_all(workers)
        .await
        .into_iter()
        .zip(tunnels)
        .map(|(joined, tunnel)| {
            let outcome = match joined {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(forward = %tunnel.forward(), "Refresh worker failed: {}", e);
                    None
                }
            };
            CheckResult {
                forward: tunnel.forward().clone(),
                outcome,
            }
        })
        .collect();

    let healthy = results
        .iter()
        .filter(|r| matches!(r.outcome, Some(Ok(RefreshOutcome::Connected))))
        .count();
    debug!(
        tunnels = results.len(),
        healthy,
        elapsed = ?started.elapsed(),
        "Health check finished"
    );

    results
}

/// Run [`check_all`] every `interval` until `cancel` fires.
///
/// A check in progress always completes; cancellation is observed between
/// checks.
pub async fn run_monitor(
    tunnels: Arc<[Arc<Tunnel>]>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(tunnels = tunnels.len(), ?interval, "Monitor started");
    loop {
        check_all(&tunnels).await;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("Monitor stopped");
}
