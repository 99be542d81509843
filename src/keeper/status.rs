//! Status snapshots and the status reporter loop.
//!
//! The reporter is a pure consumer of tunnel state: on each tick it gives
//! every idle tunnel a quick refresh, then renders the published snapshots
//! either as an aligned table or as a JSON array.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::forward::ForwardSpec;
use super::identity::MachineIdentity;
use super::tunnel::{ConnectionState, Tunnel};

/// Published view of one tunnel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelStatus {
    pub local_port: u16,
    pub host: String,
    pub remote_port: u16,
    /// Resolved node name when known, otherwise the configured host
    pub name: String,
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<MachineIdentity>,
    pub identity_stale: bool,
    /// Completion time of the last full refresh (RFC3339 format)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<String>,
}

impl TunnelStatus {
    pub(crate) fn initial(forward: &ForwardSpec) -> Self {
        Self {
            local_port: forward.local_port,
            host: forward.host.clone(),
            remote_port: forward.remote_port,
            name: Self::display_name(forward, None),
            state: ConnectionState::Disconnected,
            identity: None,
            identity_stale: false,
            last_checked: None,
        }
    }

    /// Prefer the node name the host reported, even when stale, over the
    /// address the tunnel was configured with.
    pub(crate) fn display_name(forward: &ForwardSpec, identity: Option<&MachineIdentity>) -> String {
        identity
            .map(MachineIdentity::node)
            .filter(|node| !node.is_empty())
            .unwrap_or(&forward.host)
            .to_string()
    }
}

/// How the reporter renders snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFormat {
    #[default]
    Table,
    Json,
}

const HEADERS: [&str; 5] = ["LOCAL", "NAME", "REMOTE", "STATE", "MACHINE"];

fn machine_column(status: &TunnelStatus) -> String {
    match &status.identity {
        None => "-".to_string(),
        Some(identity) if status.identity_stale => format!("{} (stale)", identity.summary()),
        Some(identity) => identity.summary(),
    }
}

/// Render snapshots as a left-aligned text table, one row per tunnel.
pub fn render_table(statuses: &[TunnelStatus]) -> String {
    let rows: Vec<[String; 5]> = statuses
        .iter()
        .map(|s| {
            [
                s.local_port.to_string(),
                s.name.clone(),
                format!("{}:{}", s.host, s.remote_port),
                s.state.to_string(),
                machine_column(s),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header = HEADERS.map(str::to_string);
    for row in std::iter::once(&header).chain(rows.iter()) {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }
    out
}

pub fn render_json(statuses: &[TunnelStatus]) -> serde_json::Result<String> {
    serde_json::to_string(statuses)
}

/// Quick-refresh every idle tunnel and collect the resulting snapshots.
pub async fn poll_statuses(tunnels: &[Arc<Tunnel>]) -> Vec<TunnelStatus> {
    join_all(tunnels.iter().map(|tunnel| async move {
        if tunnel.try_quick_refresh().await.is_none() {
            debug!(
                local_port = tunnel.forward().local_port,
                "Tunnel busy, showing last snapshot"
            );
        }
        tunnel.status()
    }))
    .await
}

fn render(statuses: &[TunnelStatus], format: StatusFormat) -> String {
    match format {
        StatusFormat::Table => render_table(statuses),
        StatusFormat::Json => match render_json(statuses) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                warn!("Failed to serialize status: {}", e);
                String::new()
            }
        },
    }
}

/// Render the status of every tunnel on `interval` until `cancel` fires.
pub async fn run_reporter<W: Write + Send>(
    tunnels: Arc<[Arc<Tunnel>]>,
    interval: Duration,
    format: StatusFormat,
    mut out: W,
    cancel: CancellationToken,
) {
    loop {
        let statuses = poll_statuses(&tunnels).await;
        let rendered = render(&statuses, format);
        if format == StatusFormat::Table {
            // Clear the screen so the table redraws in place
            let _ = write!(out, "\x1b[2J\x1b[H");
        }
        if let Err(e) = out.write_all(rendered.as_bytes()).and_then(|_| out.flush()) {
            warn!("Failed to write status: {}", e);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Status reporter stopped");
}
