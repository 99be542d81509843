//! The tunnel entity and its connection state machine.
//!
//! # States
//!
//! ```text
//! Disconnected --try_connect--> Connecting --probe ok--> Connected
//!      ^                            |                        |
//!      +------- force_disconnect ---+------------------------+
//! ```
//!
//! # Locking
//!
//! Each tunnel owns a `tokio::sync::Mutex` around its mutable state. Every
//! public operation holds it for its whole duration, so operations on one
//! tunnel never overlap while different tunnels never contend. Composite
//! operations (`refresh` calls `quick_refresh`, which may call
//! `force_disconnect`) go through the `*_locked` helpers that take the already
//! held state, so the lock is never re-acquired.
//!
//! # Status
//!
//! After each operation the tunnel publishes a [`TunnelStatus`] on a `watch`
//! channel. Readers use [`Tunnel::status`] and never touch the lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::config::ProbeTimeouts;
use super::error::{TransportError, TunnelError};
use super::forward::ForwardSpec;
use super::identity::{MachineIdentity, fetch_identity};
use super::probe;
use super::status::TunnelStatus;
use super::transport::{ForwardProcess, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Successful result of [`Tunnel::refresh`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The tunnel was down and a new forward process was started
    Spawned,
    /// The tunnel passed its probe and is connected
    Connected,
}

struct TunnelState {
    state: ConnectionState,
    process: Option<Box<dyn ForwardProcess>>,
    identity: Option<MachineIdentity>,
    identity_stale: bool,
    last_checked: Option<DateTime<Utc>>,
}

/// One managed local port forward and its lifecycle.
pub struct Tunnel {
    forward: ForwardSpec,
    transport: Arc<dyn Transport>,
    timeouts: ProbeTimeouts,
    inner: Mutex<TunnelState>,
    status_tx: watch::Sender<TunnelStatus>,
}

impl Tunnel {
    pub fn new(forward: ForwardSpec, transport: Arc<dyn Transport>, timeouts: ProbeTimeouts) -> Self {
        let (status_tx, _) = watch::channel(TunnelStatus::initial(&forward));
        Self {
            forward,
            transport,
            timeouts,
            inner: Mutex::new(TunnelState {
                state: ConnectionState::Disconnected,
                process: None,
                identity: None,
                identity_stale: false,
                last_checked: None,
            }),
            status_tx,
        }
    }

    pub fn forward(&self) -> &ForwardSpec {
        &self.forward
    }

    /// Latest published snapshot. Never waits on the tunnel lock.
    pub fn status(&self) -> TunnelStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.status_tx.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn has_process(&self) -> bool {
        self.inner.lock().await.process.is_some()
    }

    /// Cached identity and whether it is stale
    pub async fn identity(&self) -> (Option<MachineIdentity>, bool) {
        let inner = self.inner.lock().await;
        (inner.identity.clone(), inner.identity_stale)
    }

    /// Check whether the host answers a trivial command within `timeout`.
    pub async fn ping(&self, timeout: Duration) -> bool {
        probe::ping(self.transport.as_ref(), &self.forward.host, timeout).await
    }

    /// Start the forward process and move to `Connecting`.
    ///
    /// # Panics
    ///
    /// Panics if a forward process is already running for this tunnel.
    pub async fn try_connect(&self) -> Result<(), TunnelError> {
        let mut inner = self.inner.lock().await;
        let result = self.try_connect_locked(&mut inner);
        self.publish(&inner);
        result
    }

    /// Kill any forward process and move to `Disconnected`. Idempotent.
    pub async fn force_disconnect(&self) {
        let mut inner = self.inner.lock().await;
        self.force_disconnect_locked(&mut inner).await;
        self.publish(&inner);
    }

    /// Cheap maintenance step for frequent polling.
    ///
    /// Tears the tunnel down if its process died, and promotes a connecting
    /// tunnel whose host answers the quick probe.
    pub async fn quick_refresh(&self) -> Result<(), TunnelError> {
        let mut inner = self.inner.lock().await;
        let result = self.quick_refresh_locked(&mut inner).await;
        self.publish(&inner);
        result
    }

    /// [`Tunnel::quick_refresh`] if no other operation holds the tunnel.
    ///
    /// Returns `None` when skipped. A busy tunnel is being refreshed anyway.
    pub async fn try_quick_refresh(&self) -> Option<Result<(), TunnelError>> {
        let mut inner = self.inner.try_lock().ok()?;
        let result = self.quick_refresh_locked(&mut inner).await;
        self.publish(&inner);
        Some(result)
    }

    /// Full reconciliation step run by the monitor.
    pub async fn refresh(&self) -> Result<RefreshOutcome, TunnelError> {
        let mut inner = self.inner.lock().await;
        let result = self.refresh_locked(&mut inner).await;
        inner.last_checked = Some(Utc::now());
        self.publish(&inner);
        result
    }

    /// Ask the transport to cancel the forward if the tunnel is connected.
    ///
    /// Returns `None` without contacting the transport in any other state.
    pub async fn cancel_if_connected(&self) -> Option<Result<(), TransportError>> {
        let inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            return None;
        }
        Some(self.transport.cancel_forward(&self.forward).await)
    }

    fn try_connect_locked(&self, inner: &mut TunnelState) -> Result<(), TunnelError> {
        assert!(
            inner.process.is_none(),
            "try_connect on {} while its forward process is still running",
            self.forward
        );

        match self.transport.spawn_forward(&self.forward) {
            Ok(process) => {
                inner.process = Some(process);
                inner.state = ConnectionState::Connecting;
                info!(
                    local_port = self.forward.local_port,
                    host = %self.forward.host,
                    "Forward started, connecting"
                );
                Ok(())
            }
            Err(source) => {
                let err = TunnelError::SpawnFailed {
                    forward: self.forward.to_string(),
                    source,
                };
                warn!(local_port = self.forward.local_port, "{}", err);
                Err(err)
            }
        }
    }

    async fn force_disconnect_locked(&self, inner: &mut TunnelState) {
        if let Some(mut process) = inner.process.take() {
            process.terminate().await;
        }
        if inner.identity.is_some() {
            inner.identity_stale = true;
        }
        if inner.state != ConnectionState::Disconnected {
            info!(
                local_port = self.forward.local_port,
                host = %self.forward.host,
                from = %inner.state,
                "Disconnected"
            );
        }
        inner.state = ConnectionState::Disconnected;
    }

    async fn quick_refresh_locked(&self, inner: &mut TunnelState) -> Result<(), TunnelError> {
        let mut result = Ok(());

        if let Some(status) = inner
            .process
            .as_mut()
            .and_then(|process| process.try_exit_status())
        {
            let err = TunnelError::SubprocessDied {
                forward: self.forward.to_string(),
                status,
            };
            warn!(local_port = self.forward.local_port, "{}", err);
            self.force_disconnect_locked(inner).await;
            result = Err(err);
        }

        if inner.state == ConnectionState::Connecting && self.ping(self.timeouts.quick).await {
            inner.state = ConnectionState::Connected;
            info!(
                local_port = self.forward.local_port,
                host = %self.forward.host,
                "Connected"
            );
        }

        result
    }

    async fn refresh_locked(&self, inner: &mut TunnelState) -> Result<RefreshOutcome, TunnelError> {
        // Already logged where it was detected; the reconnect below handles it
        let _ = self.quick_refresh_locked(inner).await;

        if inner.state == ConnectionState::Disconnected {
            self.try_connect_locked(inner)?;
            return Ok(RefreshOutcome::Spawned);
        }

        if !self.ping(self.timeouts.full).await {
            self.force_disconnect_locked(inner).await;
            let err = TunnelError::Unreachable {
                host: self.forward.host.clone(),
            };
            warn!(local_port = self.forward.local_port, "{}", err);
            return Err(err);
        }

        if inner.identity.is_none() || inner.identity_stale {
            match fetch_identity(
                self.transport.as_ref(),
                &self.forward.host,
                self.timeouts.identity,
            )
            .await
            {
                Ok(identity) => {
                    debug!(
                        local_port = self.forward.local_port,
                        node = identity.node(),
                        "Machine identity refreshed"
                    );
                    inner.identity = Some(identity);
                    inner.identity_stale = false;
                }
                Err(source) => {
                    self.force_disconnect_locked(inner).await;
                    let err = TunnelError::IdentityFetchFailed {
                        host: self.forward.host.clone(),
                        source,
                    };
                    warn!(local_port = self.forward.local_port, "{}", err);
                    return Err(err);
                }
            }
        }

        if inner.state != ConnectionState::Connected {
            info!(
                local_port = self.forward.local_port,
                host = %self.forward.host,
                "Connected"
            );
        }
        inner.state = ConnectionState::Connected;
        Ok(RefreshOutcome::Connected)
    }

    fn publish(&self, inner: &TunnelState) {
        self.status_tx.send_replace(TunnelStatus {
            local_port: self.forward.local_port,
            host: self.forward.host.clone(),
            remote_port: self.forward.remote_port,
            name: TunnelStatus::display_name(&self.forward, inner.identity.as_ref()),
            state: inner.state,
            identity: inner.identity.clone(),
            identity_stale: inner.identity_stale,
            last_checked: inner.last_checked.map(|t| t.to_rfc3339()),
        });
    }
}
