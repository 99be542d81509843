//! Configuration resolution for the tunnel keeper.
//!
//! Every tunable value follows a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided command-line flag (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TUNNEL_CHECK_INTERVAL` | 10s | Period of the monitor loop |
//! | `TUNNEL_STATUS_INTERVAL` | 1s | Period of the status reporter |
//! | `TUNNEL_PROBE_TIMEOUT` | 10s | Timeout of the full liveness probe |
//! | `TUNNEL_QUICK_PROBE_TIMEOUT` | 2s | Timeout of the quick liveness probe |
//! | `TUNNEL_IDENTITY_TIMEOUT` | 10s | Timeout of each identity command |
//! | `TUNNEL_LOG_FILE` | `$TMPDIR/tunnel-keeper.log` | Append-only log file |
//! | `TUNNEL_SSH_BINARY` | `ssh` | Transport binary |
//! | `TUNNEL_CONTROL_DIR` | `$TMPDIR` | Directory for forward control sockets |
//!
//! Numeric values must be positive integers; anything else falls back to the
//! default.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default monitor loop period in seconds
pub(crate) const DEFAULT_CHECK_INTERVAL_SECS: u64 = 10;

/// Default status reporter period in seconds
pub(crate) const DEFAULT_STATUS_INTERVAL_SECS: u64 = 1;

/// Default full probe timeout in seconds
pub(crate) const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Default quick probe timeout in seconds
pub(crate) const DEFAULT_QUICK_PROBE_TIMEOUT_SECS: u64 = 2;

/// Default identity command timeout in seconds
pub(crate) const DEFAULT_IDENTITY_TIMEOUT_SECS: u64 = 10;

/// Default transport binary
pub(crate) const DEFAULT_SSH_BINARY: &str = "ssh";

/// File name of the log inside the temp directory
pub(crate) const DEFAULT_LOG_FILE_NAME: &str = "tunnel-keeper.log";

pub(crate) const CHECK_INTERVAL_ENV_VAR: &str = "TUNNEL_CHECK_INTERVAL";
pub(crate) const STATUS_INTERVAL_ENV_VAR: &str = "TUNNEL_STATUS_INTERVAL";
pub(crate) const PROBE_TIMEOUT_ENV_VAR: &str = "TUNNEL_PROBE_TIMEOUT";
pub(crate) const QUICK_PROBE_TIMEOUT_ENV_VAR: &str = "TUNNEL_QUICK_PROBE_TIMEOUT";
pub(crate) const IDENTITY_TIMEOUT_ENV_VAR: &str = "TUNNEL_IDENTITY_TIMEOUT";
pub(crate) const LOG_FILE_ENV_VAR: &str = "TUNNEL_LOG_FILE";
pub(crate) const SSH_BINARY_ENV_VAR: &str = "TUNNEL_SSH_BINARY";
pub(crate) const CONTROL_DIR_ENV_VAR: &str = "TUNNEL_CONTROL_DIR";

/// Timeouts applied by a tunnel to its blocking remote operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTimeouts {
    /// Used by `quick_refresh` when promoting a connecting tunnel
    pub quick: Duration,
    /// Used by `refresh` for the full liveness check
    pub full: Duration,
    /// Applied to each machine identity command
    pub identity: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            quick: Duration::from_secs(DEFAULT_QUICK_PROBE_TIMEOUT_SECS),
            full: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            identity: Duration::from_secs(DEFAULT_IDENTITY_TIMEOUT_SECS),
        }
    }
}

/// Explicit overrides, typically taken from command-line flags.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub check_interval_secs: Option<u64>,
    pub status_interval_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub quick_probe_timeout_secs: Option<u64>,
    pub identity_timeout_secs: Option<u64>,
    pub log_file: Option<PathBuf>,
    pub ssh_binary: Option<String>,
    pub control_dir: Option<PathBuf>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub check_interval: Duration,
    pub status_interval: Duration,
    pub timeouts: ProbeTimeouts,
    pub log_file: PathBuf,
    pub ssh_binary: String,
    pub control_dir: PathBuf,
}

impl KeeperConfig {
    /// Resolve every value with priority: override -> env var -> default
    pub fn resolve(overrides: &ConfigOverrides) -> Self {
        Self {
            check_interval: resolve_check_interval(overrides.check_interval_secs),
            status_interval: resolve_status_interval(overrides.status_interval_secs),
            timeouts: ProbeTimeouts {
                quick: resolve_quick_probe_timeout(overrides.quick_probe_timeout_secs),
                full: resolve_probe_timeout(overrides.probe_timeout_secs),
                identity: resolve_identity_timeout(overrides.identity_timeout_secs),
            },
            log_file: resolve_log_file(overrides.log_file.clone()),
            ssh_binary: resolve_ssh_binary(overrides.ssh_binary.clone()),
            control_dir: resolve_control_dir(overrides.control_dir.clone()),
        }
    }
}

fn resolve_secs(param: Option<u64>, env_var: &str, default_secs: u64) -> Duration {
    // Priority 1: Use parameter if provided
    if let Some(secs) = param.filter(|secs| *secs > 0) {
        return Duration::from_secs(secs);
    }

    // Priority 2: Use environment variable if set
    if let Ok(raw) = env::var(env_var)
        && let Ok(secs) = raw.trim().parse::<u64>()
        && secs > 0
    {
        return Duration::from_secs(secs);
    }

    // Priority 3: Default value
    Duration::from_secs(default_secs)
}

pub(crate) fn resolve_check_interval(param: Option<u64>) -> Duration {
    resolve_secs(param, CHECK_INTERVAL_ENV_VAR, DEFAULT_CHECK_INTERVAL_SECS)
}

pub(crate) fn resolve_status_interval(param: Option<u64>) -> Duration {
    resolve_secs(param, STATUS_INTERVAL_ENV_VAR, DEFAULT_STATUS_INTERVAL_SECS)
}

pub(crate) fn resolve_probe_timeout(param: Option<u64>) -> Duration {
    resolve_secs(param, PROBE_TIMEOUT_ENV_VAR, DEFAULT_PROBE_TIMEOUT_SECS)
}

pub(crate) fn resolve_quick_probe_timeout(param: Option<u64>) -> Duration {
    resolve_secs(
        param,
        QUICK_PROBE_TIMEOUT_ENV_VAR,
        DEFAULT_QUICK_PROBE_TIMEOUT_SECS,
    )
}

pub(crate) fn resolve_identity_timeout(param: Option<u64>) -> Duration {
    resolve_secs(param, IDENTITY_TIMEOUT_ENV_VAR, DEFAULT_IDENTITY_TIMEOUT_SECS)
}

/// Resolve the log file path with priority: parameter -> env var -> temp dir
pub(crate) fn resolve_log_file(param: Option<PathBuf>) -> PathBuf {
    if let Some(path) = param {
        return path;
    }

    if let Ok(path) = env::var(LOG_FILE_ENV_VAR)
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }

    env::temp_dir().join(DEFAULT_LOG_FILE_NAME)
}

/// Resolve the transport binary with priority: parameter -> env var -> `ssh`
pub(crate) fn resolve_ssh_binary(param: Option<String>) -> String {
    if let Some(binary) = param {
        return binary;
    }

    if let Ok(binary) = env::var(SSH_BINARY_ENV_VAR)
        && !binary.trim().is_empty()
    {
        return binary;
    }

    DEFAULT_SSH_BINARY.to_string()
}

/// Resolve the control socket directory with priority: parameter -> env var -> temp dir
pub(crate) fn resolve_control_dir(param: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = param {
        return dir;
    }

    if let Ok(dir) = env::var(CONTROL_DIR_ENV_VAR)
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Use a mutex to serialize env var tests to avoid race conditions
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn set_env(key: &str, value: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::set_var(key, value) };
    }

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn remove_env(key: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::remove_var(key) };
    }

    mod durations {
        use super::*;

        #[test]
        fn test_uses_param_when_provided() {
            assert_eq!(resolve_check_interval(Some(42)), Duration::from_secs(42));
        }

        #[test]
        fn test_param_takes_priority_over_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(PROBE_TIMEOUT_ENV_VAR, "30");
            }
            let result = resolve_probe_timeout(Some(4));
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PROBE_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(4));
        }

        #[test]
        fn test_uses_env_var_when_no_param() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(QUICK_PROBE_TIMEOUT_ENV_VAR, " 3 ");
            }
            let result = resolve_quick_probe_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(QUICK_PROBE_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(3));
        }

        #[test]
        fn test_uses_default_when_no_param_or_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(STATUS_INTERVAL_ENV_VAR);
            }
            assert_eq!(
                resolve_status_interval(None),
                Duration::from_secs(DEFAULT_STATUS_INTERVAL_SECS)
            );
        }

        #[test]
        fn test_ignores_invalid_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(IDENTITY_TIMEOUT_ENV_VAR, "soon");
            }
            let result = resolve_identity_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(IDENTITY_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(DEFAULT_IDENTITY_TIMEOUT_SECS));
        }

        #[test]
        fn test_zero_falls_back_to_default() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(CHECK_INTERVAL_ENV_VAR, "0");
            }
            let from_env = resolve_check_interval(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(CHECK_INTERVAL_ENV_VAR);
            }
            // A zero interval would spin the monitor loop
            assert_eq!(from_env, Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS));
            assert_eq!(
                resolve_check_interval(Some(0)),
                Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS)
            );
        }
    }

    mod paths {
        use super::*;

        #[test]
        fn test_log_file_param_wins() {
            let path = PathBuf::from("/var/log/keeper.log");
            assert_eq!(resolve_log_file(Some(path.clone())), path);
        }

        #[test]
        fn test_log_file_defaults_to_temp_dir() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(LOG_FILE_ENV_VAR);
            }
            assert_eq!(
                resolve_log_file(None),
                env::temp_dir().join(DEFAULT_LOG_FILE_NAME)
            );
        }

        #[test]
        fn test_empty_env_is_ignored() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(SSH_BINARY_ENV_VAR, "  ");
                set_env(CONTROL_DIR_ENV_VAR, "");
            }
            let binary = resolve_ssh_binary(None);
            let dir = resolve_control_dir(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(SSH_BINARY_ENV_VAR);
                remove_env(CONTROL_DIR_ENV_VAR);
            }
            assert_eq!(binary, DEFAULT_SSH_BINARY);
            assert_eq!(dir, env::temp_dir());
        }

        #[test]
        fn test_ssh_binary_from_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(SSH_BINARY_ENV_VAR, "/opt/openssh/bin/ssh");
            }
            let binary = resolve_ssh_binary(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(SSH_BINARY_ENV_VAR);
            }
            assert_eq!(binary, "/opt/openssh/bin/ssh");
        }
    }

    mod keeper_config {
        use super::*;

        #[test]
        fn test_overrides_flow_into_resolved_config() {
            let overrides = ConfigOverrides {
                check_interval_secs: Some(7),
                status_interval_secs: Some(2),
                probe_timeout_secs: Some(5),
                quick_probe_timeout_secs: Some(1),
                identity_timeout_secs: Some(6),
                log_file: Some(PathBuf::from("/tmp/k.log")),
                ssh_binary: Some("my-ssh".to_string()),
                control_dir: Some(PathBuf::from("/run/keeper")),
            };
            let config = KeeperConfig::resolve(&overrides);
            assert_eq!(config.check_interval, Duration::from_secs(7));
            assert_eq!(config.status_interval, Duration::from_secs(2));
            assert_eq!(config.timeouts.full, Duration::from_secs(5));
            assert_eq!(config.timeouts.quick, Duration::from_secs(1));
            assert_eq!(config.timeouts.identity, Duration::from_secs(6));
            assert_eq!(config.log_file, PathBuf::from("/tmp/k.log"));
            assert_eq!(config.ssh_binary, "my-ssh");
            assert_eq!(config.control_dir, PathBuf::from("/run/keeper"));
        }

        #[test]
        fn test_quick_probe_is_shorter_than_full_probe_by_default() {
            let timeouts = ProbeTimeouts::default();
            assert!(timeouts.quick < timeouts.full);
        }
    }
}
