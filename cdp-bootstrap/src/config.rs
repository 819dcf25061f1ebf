//! Orchestrator configuration.
//!
//! Every field has a default, so an empty YAML document (or no file at all)
//! yields a working configuration. Environment variables override the file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::BootstrapError;

/// Port the host's control protocol is expected on.
pub const DEFAULT_DEBUG_PORT: u16 = 9000;

/// Lower bound for the spacing between two automatic relaunches.
pub const MIN_RELAUNCH_COOLDOWN_MS: u64 = 180_000;

pub const ENV_PORT: &str = "CDP_BOOTSTRAP_PORT";
pub const ENV_PROBE_TIMEOUT_MS: &str = "CDP_BOOTSTRAP_PROBE_TIMEOUT_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "CDP_BOOTSTRAP_POLL_INTERVAL_MS";

/// Shell commands the driver refuses to confirm unless the user edits the list.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "rm -rf *",
    "format c:",
    "del /f /s /q",
    "rd /s /q",
    "rmdir /s /q",
    ":(){:|:&};:",
    "dd if=",
    "mkfs.",
    "> /dev/sda",
    "chmod -R 777 /",
    "shutdown",
    "reboot",
    "powershell -Command Clear-Disk",
    "Initialize-Disk",
    "Invoke-WebRequest",
    "curl",
    "wget",
    "nc -e",
    "bash -i",
    "cp /dev/zero",
    "mv ~ /dev/null",
];

/// Arguments appended when relaunching the running executable directly.
pub const DEFAULT_COMPAT_ARGS: &[&str] = &[
    "--disable-gpu-driver-bug-workarounds",
    "--ignore-gpu-blacklist",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Remote-debugging port the flag is written for
    pub port: u16,
    /// Number of ports scanned from `port` when looking for any open endpoint
    pub port_window: u16,
    pub probe_timeout_ms: u64,
    /// Minimum spacing between automatic relaunches, never below three minutes
    pub relaunch_cooldown_ms: u64,
    /// Age after which another instance's heartbeat no longer holds the lock
    pub lock_stale_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Delay before the background self-healing pass
    pub self_heal_delay_ms: u64,
    /// Seconds the relaunch script waits before starting the host again
    pub relaunch_grace_secs: u64,
    /// Delay between spawning the relaunch and asking the host to quit
    pub quit_delay_ms: u64,
    pub connection_lost_prompt_cooldown_ms: u64,
    pub poll_interval_ms: u64,
    pub blocked_patterns: Vec<String>,
    pub compat_args: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DEBUG_PORT,
            port_window: 10,
            probe_timeout_ms: 2000,
            relaunch_cooldown_ms: MIN_RELAUNCH_COOLDOWN_MS,
            lock_stale_ms: 15_000,
            heartbeat_interval_ms: 5000,
            self_heal_delay_ms: 10_000,
            relaunch_grace_secs: if cfg!(target_os = "windows") { 5 } else { 2 },
            quit_delay_ms: 1500,
            connection_lost_prompt_cooldown_ms: 60_000,
            poll_interval_ms: 1000,
            blocked_patterns: DEFAULT_BLOCKED_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            compat_args: DEFAULT_COMPAT_ARGS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from an optional YAML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, BootstrapError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| BootstrapError::from_io(format!("reading {}", path.display()), e))?;
                Self::from_yaml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.normalize();
        debug!(?config, "loaded orchestrator configuration");
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, BootstrapError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut config: Self = serde_yaml::from_str(raw)
            .map_err(|e| BootstrapError::InvalidConfig(format!("invalid YAML: {e}")))?;
        config.normalize();
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), BootstrapError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_PORT) {
            self.port = parse_number(ENV_PORT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PROBE_TIMEOUT_MS) {
            self.probe_timeout_ms = parse_number(ENV_PROBE_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_POLL_INTERVAL_MS) {
            self.poll_interval_ms = parse_number(ENV_POLL_INTERVAL_MS, &raw)?;
        }
        Ok(())
    }

    pub fn normalize(&mut self) {
        self.relaunch_cooldown_ms = self.relaunch_cooldown_ms.max(MIN_RELAUNCH_COOLDOWN_MS);
        self.port_window = self.port_window.max(1);
        self.probe_timeout_ms = self.probe_timeout_ms.max(1);
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.max(1);
    }

    /// The exact flag every launch entry must carry.
    pub fn debug_flag(&self) -> String {
        crate::entry::required_flag(self.port)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn self_heal_delay(&self) -> Duration {
        Duration::from_millis(self.self_heal_delay_ms)
    }

    pub fn quit_delay(&self) -> Duration {
        Duration::from_millis(self.quit_delay_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, BootstrapError> {
    raw.trim()
        .parse()
        .map_err(|_| BootstrapError::InvalidConfig(format!("{key} must be a number, got '{raw}'")))
}
