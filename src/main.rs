mod classify;
mod config;
mod monitor;
mod signals;
mod sink;
mod status;
mod supervisor;
mod validate;
mod watchdog;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use crate::config::MonitorConfig;
use crate::monitor::{ConnectionMonitor, ConnectionState, Notification};
use crate::sink::from_path;
use crate::status::StatusFile;

/// Run an OpenVPN client under supervision, report the assigned tunnel
/// address, and stop the client cleanly on exit.
///
/// Examples:
///     ovpn-monitor config.ovpn
///     ovpn-monitor config.ovpn --log-file ~/vpn.log
#[derive(Parser, Debug)]
#[command(name = "ovpn-monitor", version, about, verbatim_doc_comment)]
pub struct Cli {
    /// Path to the OpenVPN configuration file (.ovpn)
    #[arg(value_name = "OVPN_FILE")]
    ovpn_file: PathBuf,

    /// Write significant events to this log file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Settings file
    #[arg(short, long, default_value = "ovpn-monitor.toml")]
    config: PathBuf,

    /// Idle timeout in seconds (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Launch openvpn directly instead of through the elevation tool
    #[arg(long)]
    no_elevate: bool,

    /// Publish connection status as JSON to this file
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Validate the OpenVPN config and print resolved settings, don't connect
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (poll and cleanup detail)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    /// Merge command-line overrides into the loaded config.
    fn apply(&self, config: &mut MonitorConfig) {
        config.vpn.config_file = self.ovpn_file.clone();
        if let Some(log_file) = &self.log_file {
            config.log.file = Some(log_file.clone());
        }
        if let Some(secs) = self.timeout {
            config.monitor.idle_timeout_ms = secs.saturating_mul(1000);
        }
        if self.no_elevate {
            config.vpn.elevation = String::new();
            if config.vpn.kill_fallback.first().map(String::as_str) == Some("sudo") {
                config.vpn.kill_fallback.remove(0);
            }
        }
    }

    fn log_filter(&self) -> EnvFilter {
        let default = if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Diagnostics go to stderr; stdout carries the mirrored VPN output.
    tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter())
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match MonitorConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);

    if cli.dry_run {
        return dry_run(&config);
    }

    let status_file = cli.status_file.clone().map(StatusFile::new);
    if let Some(sf) = &status_file {
        tracing::debug!(path = %sf.path().display(), "publishing status");
    }
    let mut monitor =
        ConnectionMonitor::new().with_log_sink(from_path(config.log.file.as_deref()));
    let mut notifications = monitor.subscribe();

    if let Err(e) = monitor.start(&config) {
        eprintln!("Error: {e}");
        if let Some(sf) = &status_file {
            sf.update(&monitor.status());
        }
        return ExitCode::FAILURE;
    }

    let shutdown = signals::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            sig = &mut shutdown => {
                tracing::info!(signal = %sig, "shutdown requested");
                break;
            }
            notification = notifications.recv() => {
                let Some(notification) = notification else { break };
                match notification {
                    Notification::State(state) => {
                        if let Some(sf) = &status_file {
                            sf.update(&monitor.status());
                        }
                        if state.is_terminal() {
                            break;
                        }
                    }
                    Notification::Address(address) => {
                        println!("VPN IP Address: {address}");
                    }
                    Notification::Event(event) => {
                        tracing::debug!(tag = ?event.tag, marker = ?event.tag.marker(), "significant event");
                    }
                }
            }
        }
    }

    let final_state = monitor.state();
    let last_address = monitor.address();
    monitor.stop().await;
    tracing::debug!(
        address = ?last_address.as_ref().map(|a| a.as_str()),
        alive = monitor.is_alive(),
        exit_code = ?monitor.exit_code(),
        "monitor stopped"
    );
    if let Some(sf) = &status_file {
        sf.remove();
    }

    println!("Bye!");
    match final_state {
        ConnectionState::Failed(reason) => {
            eprintln!("Error: {reason}");
            ExitCode::FAILURE
        }
        _ => ExitCode::SUCCESS,
    }
}

fn dry_run(config: &MonitorConfig) -> ExitCode {
    println!("ovpn-monitor v{}", env!("CARGO_PKG_VERSION"));
    println!("Command:      {}", config.launch_command());
    println!("Idle timeout: {:?}", config.monitor.idle_timeout());
    println!(
        "Log file:     {}",
        config
            .log
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );

    match validate::validate(&config.vpn.config_file) {
        Ok(()) => {
            println!("Dry run mode: config validated, not connecting.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
