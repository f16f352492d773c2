use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::supervisor::LaunchCommand;

/// Markers whose lines are worth persisting to the log sink.
pub const DEFAULT_IMPORTANT_EVENTS: [&str; 11] = [
    "CONNECTED",
    "DISCONNECT",
    "AUTH_FAILED",
    "TLS_ERROR",
    "PUSH_REPLY",
    "Initialization Sequence Completed",
    "ERROR:",
    "FATAL:",
    "TCP connection established",
    "Peer Connection Initiated",
    "Connection reset",
];

/// Top-level configuration loaded from ovpn-monitor.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    pub vpn: VpnConfig,
    pub monitor: WatchConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    pub config_file: PathBuf,
    pub binary: String,
    /// Privilege-elevation launcher. Empty runs the binary directly.
    pub elevation: String,
    /// Broad termination run after the direct kill. Empty disables it.
    pub kill_fallback: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub idle_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    pub important_events: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    pub file: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("client.ovpn"),
            binary: "openvpn".to_string(),
            elevation: "sudo".to_string(),
            kill_fallback: vec![
                "sudo".to_string(),
                "killall".to_string(),
                "openvpn".to_string(),
            ],
        }
    }
}

const MIN_POLL_INTERVAL_MS: u64 = 10;

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 10_000,
            poll_interval_ms: 1_000,
            shutdown_grace_ms: 2_000,
            important_events: DEFAULT_IMPORTANT_EVENTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl WatchConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Clamped to at least `MIN_POLL_INTERVAL_MS`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl MonitorConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Argument vector `[elevation, binary, config_file]`.
    pub fn launch_command(&self) -> LaunchCommand {
        let mut argv = Vec::with_capacity(3);
        if !self.vpn.elevation.is_empty() {
            argv.push(self.vpn.elevation.clone());
        }
        argv.push(self.vpn.binary.clone());
        argv.push(self.vpn.config_file.display().to_string());
        LaunchCommand::from_argv(argv)
    }
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}
