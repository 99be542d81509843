//! Forward signatures and startup validation of command-line targets.
//!
//! A target is written `localPort:host` or `localPort:host:remotePort`. The
//! remote port is the port on `host` itself that the local port forwards to,
//! and defaults to the SSH port.

use std::collections::HashSet;
use std::fmt;
use std::net::TcpListener;

use serde::Serialize;

use super::error::StartupError;

/// Remote port used when a target omits it
pub const DEFAULT_REMOTE_PORT: u16 = 22;

/// Lowest local port a target may claim
pub const MIN_LOCAL_PORT: u16 = 1024;

/// The `(localPort, remotePort, host)` triple identifying one tunnel to the
/// transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ForwardSpec {
    pub local_port: u16,
    pub host: String,
    pub remote_port: u16,
}

impl ForwardSpec {
    pub fn new(local_port: u16, host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            host: host.into(),
            remote_port,
        }
    }

    /// Parse a single `localPort:host[:remotePort]` target.
    ///
    /// Only the syntax is checked here; see [`validate_targets`] for the
    /// port range and availability rules.
    ///
    /// # Examples
    ///
    /// ```
    /// use tunnel_keeper::keeper::forward::ForwardSpec;
    ///
    /// let spec = ForwardSpec::parse("8080:example.com").unwrap();
    /// assert_eq!(spec, ForwardSpec::new(8080, "example.com", 22));
    /// ```
    pub fn parse(raw: &str) -> Result<Self, StartupError> {
        let tokens: Vec<&str> = raw.split(':').collect();
        let (local, host, remote) = match tokens.as_slice() {
            [local, host] => (*local, *host, None),
            [local, host, remote] => (*local, *host, Some(*remote)),
            _ => {
                return Err(StartupError::InvalidSpec {
                    spec: raw.to_string(),
                });
            }
        };

        // A leading dash would reach ssh as an option
        if host.trim().is_empty() || host.trim().starts_with('-') {
            return Err(StartupError::InvalidSpec {
                spec: raw.to_string(),
            });
        }

        let local_port = parse_port(raw, local)?;
        let remote_port = match remote {
            Some(remote) => parse_port(raw, remote)?,
            None => DEFAULT_REMOTE_PORT,
        };

        Ok(Self::new(local_port, host.trim(), remote_port))
    }

    /// The `-L` argument handed to the transport
    pub fn forward_arg(&self) -> String {
        format!("{}:localhost:{}", self.local_port, self.remote_port)
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.local_port, self.host, self.remote_port)
    }
}

fn parse_port(spec: &str, value: &str) -> Result<u16, StartupError> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| StartupError::InvalidPort {
            spec: spec.to_string(),
            value: value.to_string(),
        })
}

/// Answers whether a local port is free to be claimed by a forward.
pub trait PortChecker {
    fn is_available(&self, port: u16) -> bool;
}

/// Checks availability by briefly binding the port on the loopback interface.
pub struct LoopbackPortChecker;

impl PortChecker for LoopbackPortChecker {
    fn is_available(&self, port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

/// Parse and validate every command-line target.
///
/// Fails on the first malformed target, privileged or duplicated local port,
/// or a local port that is already bound. An empty target list is an error.
pub fn validate_targets<S: AsRef<str>>(
    raw: &[S],
    ports: &dyn PortChecker,
) -> Result<Vec<ForwardSpec>, StartupError> {
    if raw.is_empty() {
        return Err(StartupError::NoTargets);
    }

    let mut seen = HashSet::with_capacity(raw.len());
    let mut forwards = Vec::with_capacity(raw.len());

    for spec in raw {
        let forward = ForwardSpec::parse(spec.as_ref())?;

        if forward.local_port < MIN_LOCAL_PORT {
            return Err(StartupError::PrivilegedPort {
                port: forward.local_port,
            });
        }
        if !seen.insert(forward.local_port) {
            return Err(StartupError::DuplicatePort {
                port: forward.local_port,
            });
        }
        if !ports.is_available(forward.local_port) {
            return Err(StartupError::PortInUse {
                port: forward.local_port,
            });
        }

        forwards.push(forward);
    }

    Ok(forwards)
}
