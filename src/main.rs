#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{CommandFactory, Parser};
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tunnel_keeper::keeper::{
    ConfigOverrides, Keeper, KeeperConfig, LoopbackPortChecker, SshTransport, StatusFormat,
    validate_targets,
};

/// Keep SSH local port forwards alive and show their status.
#[derive(Parser, Debug)]
#[command(name = "tunnel-keeper", version, about)]
struct Cli {
    /// Forward targets as localPort:host[:remotePort] (remote port defaults to 22)
    #[arg(value_name = "SPEC")]
    specs: Vec<String>,

    /// Seconds between full health checks [env: TUNNEL_CHECK_INTERVAL]
    #[arg(long, value_name = "SECS")]
    check_interval: Option<u64>,

    /// Seconds between status redraws [env: TUNNEL_STATUS_INTERVAL]
    #[arg(long, value_name = "SECS")]
    status_interval: Option<u64>,

    /// Timeout of the full reachability probe [env: TUNNEL_PROBE_TIMEOUT]
    #[arg(long, value_name = "SECS")]
    probe_timeout: Option<u64>,

    /// Timeout of the quick reachability probe [env: TUNNEL_QUICK_PROBE_TIMEOUT]
    #[arg(long, value_name = "SECS")]
    quick_probe_timeout: Option<u64>,

    /// Timeout of each identity command [env: TUNNEL_IDENTITY_TIMEOUT]
    #[arg(long, value_name = "SECS")]
    identity_timeout: Option<u64>,

    /// Append-only log file [env: TUNNEL_LOG_FILE]
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// ssh binary used for forwards and probes [env: TUNNEL_SSH_BINARY]
    #[arg(long = "ssh", value_name = "PATH")]
    ssh_binary: Option<String>,

    /// Render status as JSON instead of a table
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            check_interval_secs: self.check_interval,
            status_interval_secs: self.status_interval,
            probe_timeout_secs: self.probe_timeout,
            quick_probe_timeout_secs: self.quick_probe_timeout,
            identity_timeout_secs: self.identity_timeout,
            log_file: self.log_file.clone(),
            ssh_binary: self.ssh_binary.clone(),
            control_dir: None,
        }
    }

    fn format(&self) -> StatusFormat {
        if self.json {
            StatusFormat::Json
        } else {
            StatusFormat::Table
        }
    }
}

/// Log to a file so stdout stays free for the status display.
fn init_logging(path: &Path) -> std::io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let cli = Cli::parse();
    let config = KeeperConfig::resolve(&cli.overrides());
    init_logging(&config.log_file)?;

    let forwards = match validate_targets(&cli.specs, &LoopbackPortChecker) {
        Ok(forwards) => forwards,
        Err(e) => {
            error!("Invalid startup arguments: {}", e);
            eprintln!("error: {}\n\n{}", e, Cli::command().render_usage());
            std::process::exit(2);
        }
    };

    info!(
        tunnels = forwards.len(),
        check_interval = ?config.check_interval,
        log_file = %config.log_file.display(),
        "Starting tunnel keeper"
    );

    let transport = Arc::new(SshTransport::new(
        config.ssh_binary.clone(),
        config.control_dir.clone(),
    ));
    let keeper = Keeper::new(forwards, transport, &config, cli.format());
    keeper.run_until(std::io::stdout(), wait_for_signal()).await;

    info!("Tunnel keeper stopped");
    Ok(())
}
