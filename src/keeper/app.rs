//! Top-level orchestration.
//!
//! [`Keeper`] owns the tunnel set and runs the two background loops:
//!
//! - the monitor ([`run_monitor`]), which reconciles every tunnel each
//!   `check_interval`
//! - the reporter ([`run_reporter`]), which renders status each
//!   `status_interval`
//!
//! On the termination signal both loops are stopped and joined, the
//! [`ShutdownHandler`] cancels the forwards that are up, and every remaining
//! forward process is reaped.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::checker::run_monitor;
use super::config::KeeperConfig;
use super::forward::ForwardSpec;
use super::shutdown::ShutdownHandler;
use super::status::{StatusFormat, run_reporter};
use super::transport::Transport;
use super::tunnel::Tunnel;

pub struct Keeper {
    tunnels: Arc<[Arc<Tunnel>]>,
    check_interval: Duration,
    status_interval: Duration,
    format: StatusFormat,
    shutdown: ShutdownHandler,
}

impl Keeper {
    /// Build one disconnected tunnel per forward. Nothing is spawned until
    /// the first monitor cycle.
    pub fn new(
        forwards: Vec<ForwardSpec>,
        transport: Arc<dyn Transport>,
        config: &KeeperConfig,
        format: StatusFormat,
    ) -> Self {
        let tunnels: Arc<[Arc<Tunnel>]> = forwards
            .into_iter()
            .map(|forward| Arc::new(Tunnel::new(forward, transport.clone(), config.timeouts)))
            .collect();

        Self {
            shutdown: ShutdownHandler::new(tunnels.clone()),
            tunnels,
            check_interval: config.check_interval,
            status_interval: config.status_interval,
            format,
        }
    }

    pub fn tunnels(&self) -> &[Arc<Tunnel>] {
        &self.tunnels
    }

    /// Run the monitor and the reporter (writing to `out`) until `signal`
    /// completes, then shut down.
    pub async fn run_until<W, F>(&self, out: W, signal: F)
    where
        W: Write + Send + 'static,
        F: Future<Output = ()>,
    {
        let cancel = CancellationToken::new();

        let monitor = tokio::spawn(run_monitor(
            self.tunnels.clone(),
            self.check_interval,
            cancel.clone(),
        ));
        let reporter = tokio::spawn(run_reporter(
            self.tunnels.clone(),
            self.status_interval,
            self.format,
            out,
            cancel.clone(),
        ));
        info!(tunnels = self.tunnels.len(), "Tunnel keeper running");

        signal.await;
        info!("Termination requested, stopping");

        cancel.cancel();
        if let Err(e) = monitor.await {
            error!("Monitor task failed: {}", e);
        }
        if let Err(e) = reporter.await {
            error!("Reporter task failed: {}", e);
        }

        self.shutdown().await;
    }

    /// Cancel connected forwards, then reap every forward process.
    ///
    /// Returns the number of cancel requests issued. Safe to call more than
    /// once; only the first call sends cancels.
    pub async fn shutdown(&self) -> usize {
        let cancelled = self.shutdown.run().await;
        join_all(self.tunnels.iter().map(|tunnel| tunnel.force_disconnect())).await;
        info!("All forwards stopped");
        cancelled
    }
}
