//! Machine identity discovery.
//!
//! After a successful probe, a tunnel asks its host who it is by running a
//! short sequence of descriptor commands. Hosts running one of the recognised
//! device operating systems get the richer [`MachineIdentity::Device`] record;
//! everything else is [`MachineIdentity::Generic`].

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use super::error::IdentityError;
use super::transport::Transport;

pub(crate) const OS_COMMAND: &str = ". /etc/os-release 2>/dev/null && echo \"$NAME\" || uname -s";
pub(crate) const NODE_COMMAND: &str = "uname -n";
pub(crate) const LSB_RELEASE_COMMAND: &str = "cat /etc/lsb-release";
pub(crate) const MODEL_COMMAND: &str = "cros_config / name 2>/dev/null || true";
pub(crate) const SKU_COMMAND: &str = "cros_config /identity sku-id 2>/dev/null || true";

/// Operating systems that produce a device identity, compared ignoring case
/// and spaces
const DEVICE_OPERATING_SYSTEMS: &[&str] = &["chromeos", "chromiumos"];

const BOARD_KEY: &str = "CHROMEOS_RELEASE_BOARD";
const BUILD_KEY: &str = "CHROMEOS_RELEASE_VERSION";

/// Placeholder for optional descriptor fields the device did not report
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MachineIdentity {
    Generic {
        address: String,
        os: String,
        node: String,
    },
    Device {
        address: String,
        os: String,
        node: String,
        board: String,
        model: String,
        sku: String,
        build: String,
    },
}

impl MachineIdentity {
    pub fn address(&self) -> &str {
        match self {
            MachineIdentity::Generic { address, .. } | MachineIdentity::Device { address, .. } => {
                address
            }
        }
    }

    pub fn os(&self) -> &str {
        match self {
            MachineIdentity::Generic { os, .. } | MachineIdentity::Device { os, .. } => os,
        }
    }

    pub fn node(&self) -> &str {
        match self {
            MachineIdentity::Generic { node, .. } | MachineIdentity::Device { node, .. } => node,
        }
    }

    /// One-line description for the status display
    pub fn summary(&self) -> String {
        match self {
            MachineIdentity::Generic { os, .. } => os.clone(),
            MachineIdentity::Device {
                board,
                model,
                sku,
                build,
                ..
            } => format!("{} {} sku:{} {}", board, model, sku, build),
        }
    }
}

pub(crate) fn is_device_os(os: &str) -> bool {
    let normalized: String = os
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    DEVICE_OPERATING_SYSTEMS.contains(&normalized.as_str())
}

/// Parse `KEY=VALUE` lines, stripping optional quotes around values.
pub(crate) fn parse_key_values(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            (
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect()
}

async fn run_line(
    transport: &dyn Transport,
    host: &str,
    command: &str,
    timeout: Duration,
) -> Result<String, IdentityError> {
    let output = transport.run_remote_command(host, command, timeout).await?;
    Ok(output.lines().next().unwrap_or_default().trim().to_string())
}

async fn run_required_line(
    transport: &dyn Transport,
    host: &str,
    command: &str,
    timeout: Duration,
) -> Result<String, IdentityError> {
    let line = run_line(transport, host, command, timeout).await?;
    if line.is_empty() {
        return Err(IdentityError::Malformed {
            command: command.to_string(),
            output: line,
        });
    }
    Ok(line)
}

fn or_unknown(value: String) -> String {
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value
    }
}

/// Fetch the identity of a host the caller has already found reachable.
///
/// Each command is bounded by `timeout`. Any command failure or unusable
/// output fails the whole fetch.
pub async fn fetch_identity(
    transport: &dyn Transport,
    host: &str,
    timeout: Duration,
) -> Result<MachineIdentity, IdentityError> {
    let os = run_required_line(transport, host, OS_COMMAND, timeout).await?;
    let node = run_required_line(transport, host, NODE_COMMAND, timeout).await?;

    if !is_device_os(&os) {
        return Ok(MachineIdentity::Generic {
            address: host.to_string(),
            os,
            node,
        });
    }

    let lsb_output = transport
        .run_remote_command(host, LSB_RELEASE_COMMAND, timeout)
        .await?;
    let lsb = parse_key_values(&lsb_output);
    let board = lsb
        .get(BOARD_KEY)
        .filter(|board| !board.is_empty())
        .cloned()
        .ok_or_else(|| IdentityError::Malformed {
            command: LSB_RELEASE_COMMAND.to_string(),
            output: lsb_output.clone(),
        })?;
    let build = or_unknown(lsb.get(BUILD_KEY).cloned().unwrap_or_default());

    let model = or_unknown(run_line(transport, host, MODEL_COMMAND, timeout).await?);
    let sku = or_unknown(run_line(transport, host, SKU_COMMAND, timeout).await?);

    Ok(MachineIdentity::Device {
        address: host.to_string(),
        os,
        node,
        board,
        model,
        sku,
        build,
    })
}
