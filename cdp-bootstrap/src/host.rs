//! The host application and the collaborators it provides.
//!
//! The orchestrator never renders UI or drives the host's interface itself;
//! it talks to a [`HostShell`] for prompts, indicators and process control,
//! and to a [`PortDriver`] that does the actual work once the port is open.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::BootstrapError;

/// Hosts with known launch-entry naming.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostApp {
    Cursor,
    Antigravity,
    Windsurf,
    Trae,
    VsCode,
    Other(String),
}

impl HostApp {
    /// Map the name the host reports about itself to a known host.
    pub fn detect(app_name: &str) -> Self {
        let lower = app_name.to_lowercase();
        if lower.contains("cursor") {
            HostApp::Cursor
        } else if lower.contains("antigravity") {
            HostApp::Antigravity
        } else if lower.contains("windsurf") {
            HostApp::Windsurf
        } else if lower.contains("trae") {
            HostApp::Trae
        } else if lower.contains("code") || lower.contains("vs") {
            HostApp::VsCode
        } else if app_name.trim().is_empty() {
            HostApp::Other("IDE".to_string())
        } else {
            HostApp::Other(app_name.trim().to_string())
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            HostApp::Cursor => "Cursor",
            HostApp::Antigravity => "Antigravity",
            HostApp::Windsurf => "Windsurf",
            HostApp::Trae => "Trae",
            HostApp::VsCode => "VS Code",
            HostApp::Other(name) => name,
        }
    }

    /// Name used by shortcut files and app bundles.
    pub fn shortcut_name(&self) -> &str {
        match self {
            HostApp::VsCode => "Visual Studio Code",
            other => other.display_name(),
        }
    }

    /// Lowercase identifier for desktop files, registry classes and store keys.
    pub fn slug(&self) -> String {
        match self {
            HostApp::VsCode => "code".to_string(),
            other => other
                .display_name()
                .to_lowercase()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("-"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// What the status indicator currently shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "state")]
pub enum Indicator {
    Disabled,
    Enabled { background_mode: bool },
    /// Another instance holds the lock
    Standby,
    /// Port closed although launch entries were configured; clicking relaunches
    ConnectionLimited,
    /// The user declined setup
    LimitedMode,
}

impl Indicator {
    pub fn text(&self) -> &'static str {
        match self {
            Indicator::Disabled => "$(zap) Off",
            Indicator::Enabled {
                background_mode: false,
            } => "$(zap) On",
            Indicator::Enabled {
                background_mode: true,
            } => "$(zap) Multi",
            Indicator::Standby => "$(debug-pause) Standby",
            Indicator::ConnectionLimited => "$(warning) Limited",
            Indicator::LimitedMode => "$(circle-slash) Limited",
        }
    }

    pub fn tooltip(&self, debug_flag: &str) -> String {
        match self {
            Indicator::Disabled => "Disabled. Click to enable.".to_string(),
            Indicator::Enabled { background_mode } => {
                if *background_mode {
                    "Enabled for all tabs. Click to disable.".to_string()
                } else {
                    "Enabled for the active tab. Click for all tabs.".to_string()
                }
            }
            Indicator::Standby => "Another window is in control. This one is on standby.".to_string(),
            Indicator::ConnectionLimited => format!(
                "Remote debugging is not reachable. Click to relaunch with {debug_flag}, or start the host from its shortcut."
            ),
            Indicator::LimitedMode => format!(
                "Setup was skipped. Launch the host with {debug_flag} for full functionality."
            ),
        }
    }

    pub fn is_dismissible(&self) -> bool {
        matches!(self, Indicator::ConnectionLimited | Indicator::LimitedMode)
    }
}

/// UI and process services provided by the host.
#[async_trait]
pub trait HostShell: Send + Sync {
    /// Show a message and return the label of the chosen option, if any.
    async fn show_message(
        &self,
        level: MessageLevel,
        message: &str,
        choices: &[&str],
    ) -> Option<String>;

    async fn set_indicator(&self, indicator: Indicator);

    /// Ask the host to quit. The relaunch script starts the replacement.
    async fn request_quit(&self);

    async fn request_restart(&self);

    async fn open_settings(&self);

    /// Folders currently open in the host, forwarded to the replacement process.
    fn workspace_paths(&self) -> Vec<PathBuf>;
}

/// Settings forwarded to the driver on every sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub pro_mode: bool,
    pub background_mode: bool,
    pub poll_interval_ms: u64,
    pub host_name: String,
    pub blocked_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub clicks: u64,
    pub terminal_commands: u64,
    pub file_edits: u64,
    pub blocked: u64,
    pub estimated_time_saved_minutes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub clicks: u64,
    pub blocked: u64,
}

/// The component that drives the host over the control protocol.
#[async_trait]
pub trait PortDriver: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Start or resync with the given settings. Safe to call repeatedly.
    async fn start(&self, config: DriverConfig) -> Result<(), BootstrapError>;

    async fn stop(&self) -> Result<(), BootstrapError>;

    fn connection_count(&self) -> usize;

    async fn session_summary(&self) -> SessionSummary;

    async fn reset_stats(&self) -> StatsSnapshot;

    async fn away_actions(&self) -> u64;

    async fn set_focus_state(&self, focused: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_hosts() {
        assert_eq!(HostApp::detect("Cursor"), HostApp::Cursor);
        assert_eq!(HostApp::detect("Antigravity"), HostApp::Antigravity);
        assert_eq!(HostApp::detect("Visual Studio Code"), HostApp::VsCode);
        assert_eq!(HostApp::detect("Windsurf Next"), HostApp::Windsurf);
        assert_eq!(HostApp::detect(""), HostApp::Other("IDE".to_string()));
        assert_eq!(HostApp::detect("Zed"), HostApp::Other("Zed".to_string()));
    }

    #[test]
    fn names_and_slugs() {
        assert_eq!(HostApp::VsCode.slug(), "code");
        assert_eq!(HostApp::VsCode.shortcut_name(), "Visual Studio Code");
        assert_eq!(HostApp::Cursor.slug(), "cursor");
        assert_eq!(HostApp::Other("My Editor".into()).slug(), "my-editor");
    }

    #[test]
    fn only_limited_indicators_are_dismissible() {
        assert!(Indicator::ConnectionLimited.is_dismissible());
        assert!(!Indicator::Standby.is_dismissible());
        assert!(Indicator::ConnectionLimited
            .tooltip("--remote-debugging-port=9000")
            .contains("--remote-debugging-port=9000"));
    }
}
