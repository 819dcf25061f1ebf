//! Host collaborators for running the orchestrator from a terminal.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdp_bootstrap::{
    BootstrapError, DriverConfig, HostShell, Indicator, MessageLevel, PortDriver, PortProber,
    SessionSummary, StatsSnapshot,
};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Prints messages and reads choices from stdin.
pub struct TerminalShell {
    workspace: Vec<PathBuf>,
    assume_yes: bool,
    debug_flag: String,
    quit: Arc<Notify>,
}

impl TerminalShell {
    pub fn new(workspace: Vec<PathBuf>, assume_yes: bool, debug_flag: String) -> Self {
        Self {
            workspace,
            assume_yes,
            debug_flag,
            quit: Arc::new(Notify::new()),
        }
    }

    /// Notified when the orchestrator asks the host to quit.
    pub fn quit_signal(&self) -> Arc<Notify> {
        self.quit.clone()
    }
}

fn pick_choice(line: &str, choices: &[&str]) -> Option<String> {
    let answer = line.trim();
    if answer.is_empty() {
        return None;
    }
    if let Ok(index) = answer.parse::<usize>() {
        return choices.get(index.checked_sub(1)?).map(|c| c.to_string());
    }
    choices
        .iter()
        .find(|c| c.eq_ignore_ascii_case(answer))
        .map(|c| c.to_string())
}

#[async_trait]
impl HostShell for TerminalShell {
    async fn show_message(
        &self,
        level: MessageLevel,
        message: &str,
        choices: &[&str],
    ) -> Option<String> {
        let label = match level {
            MessageLevel::Info => "info".cyan().bold(),
            MessageLevel::Warning => "warning".yellow().bold(),
            MessageLevel::Error => "error".red().bold(),
        };
        println!("{label}: {message}");
        if choices.is_empty() {
            return None;
        }
        if self.assume_yes {
            println!("  -> {}", choices[0].green());
            return Some(choices[0].to_string());
        }

        for (i, choice) in choices.iter().enumerate() {
            println!("  {}. {}", i + 1, choice);
        }
        print!("{} ", "choose:".bold());
        let _ = std::io::Write::flush(&mut std::io::stdout());

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => pick_choice(&line, choices),
        }
    }

    async fn set_indicator(&self, indicator: Indicator) {
        let text = indicator.text();
        let styled = match &indicator {
            Indicator::Enabled { .. } => text.green(),
            Indicator::ConnectionLimited | Indicator::LimitedMode => text.yellow(),
            Indicator::Standby => text.blue(),
            Indicator::Disabled => text.dimmed(),
        };
        println!("{} {}", "status:".bold(), styled);
        debug!(tooltip = %indicator.tooltip(&self.debug_flag), "indicator updated");
    }

    async fn request_quit(&self) {
        println!("{}", "The host was asked to quit for relaunch.".yellow());
        self.quit.notify_waiters();
    }

    async fn request_restart(&self) {
        println!("{}", "The host was asked to restart.".yellow());
        self.quit.notify_waiters();
    }

    async fn open_settings(&self) {
        println!("Settings are read from the YAML file passed with --config.");
    }

    fn workspace_paths(&self) -> Vec<PathBuf> {
        self.workspace.clone()
    }
}

/// A driver that only watches the endpoint: its connection count is the
/// number of page targets the endpoint lists.
pub struct EndpointDriver {
    prober: PortProber,
    port: u16,
    timeout: Duration,
    running: AtomicBool,
    connections: AtomicUsize,
    away: AtomicU64,
}

impl EndpointDriver {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self {
            prober: PortProber::new(),
            port,
            timeout,
            running: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            away: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl PortDriver for EndpointDriver {
    async fn is_available(&self) -> bool {
        self.prober.probe(self.port, self.timeout).await
    }

    async fn start(&self, config: DriverConfig) -> Result<(), BootstrapError> {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(host = %config.host_name, background = config.background_mode, "driver started");
        }
        let pages = match self.prober.list_targets(self.port, self.timeout).await {
            Ok(targets) => targets.iter().filter(|t| t.target_type == "page").count(),
            Err(e) => {
                debug!("listing targets failed: {}", e);
                0
            }
        };
        self.connections.store(pages, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BootstrapError> {
        self.running.store(false, Ordering::SeqCst);
        self.connections.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    async fn session_summary(&self) -> SessionSummary {
        SessionSummary::default()
    }

    async fn reset_stats(&self) -> StatsSnapshot {
        StatsSnapshot::default()
    }

    async fn away_actions(&self) -> u64 {
        self.away.swap(0, Ordering::SeqCst)
    }

    async fn set_focus_state(&self, focused: bool) {
        debug!(focused, "focus state changed");
    }
}
