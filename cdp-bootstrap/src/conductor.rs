//! Relaunching the host with the flag applied.
//!
//! Fallback tiers, in order: nothing to do (port already open), relaunch
//! through the primary launch entry, relaunch the running executable
//! directly. Only when the last tier has no executable does a relaunch fail.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::entry::{LaunchEntry, PatchOutcome};
use crate::errors::BootstrapError;
use crate::host::HostShell;
use crate::platforms::{LaunchCommand, LaunchEnvironment};
use crate::probe::PortCheck;
use crate::process::ProcessControl;
use crate::scheduler::DelayedTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelaunchAction {
    /// The port was already reachable
    None,
    Relaunched,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaunchOutcome {
    pub success: bool,
    pub action: RelaunchAction,
    pub message: String,
}

impl RelaunchOutcome {
    fn not_needed() -> Self {
        Self {
            success: true,
            action: RelaunchAction::None,
            message: "Remote debugging already available".to_string(),
        }
    }

    fn relaunched(message: impl Into<String>) -> Self {
        Self {
            success: true,
            action: RelaunchAction::Relaunched,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            action: RelaunchAction::Error,
            message: message.into(),
        }
    }
}

/// Result of patching every located entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Entries as they are after patching
    pub entries: Vec<LaunchEntry>,
    pub modified: usize,
    pub failed: usize,
    pub messages: Vec<String>,
}

impl RepairReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(&mut self, entry: &LaunchEntry, outcome: &PatchOutcome) {
        if outcome.modified {
            self.modified += 1;
        }
        if !outcome.success {
            self.failed += 1;
        }
        self.messages
            .push(format!("{} ({}): {}", entry.file_name(), entry.kind, outcome.message));
    }
}

pub struct RelaunchConductor {
    environment: Arc<dyn LaunchEnvironment>,
    prober: Arc<dyn PortCheck>,
    process: Arc<dyn ProcessControl>,
    shell: Arc<dyn HostShell>,
    config: OrchestratorConfig,
}

impl RelaunchConductor {
    pub fn new(
        environment: Arc<dyn LaunchEnvironment>,
        prober: Arc<dyn PortCheck>,
        process: Arc<dyn ProcessControl>,
        shell: Arc<dyn HostShell>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            environment,
            prober,
            process,
            shell,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn port_reachable(&self) -> bool {
        self.prober
            .is_reachable(self.config.port, self.config.probe_timeout())
            .await
    }

    pub async fn locate(&self) -> Vec<LaunchEntry> {
        self.environment.locate().await
    }

    pub async fn patch(&self, entry: &mut LaunchEntry) -> PatchOutcome {
        self.environment.patch(entry).await
    }

    /// Patch every entry; a failure on one never stops the others.
    pub async fn configure_all(&self, mut entries: Vec<LaunchEntry>) -> RepairReport {
        let mut report = RepairReport::default();
        for entry in entries.iter_mut() {
            let outcome = self.environment.patch(entry).await;
            if outcome.success {
                debug!(path = %entry.path.display(), modified = outcome.modified, "patched launch entry");
            } else {
                warn!(path = %entry.path.display(), "failed to patch launch entry: {}", outcome.message);
            }
            report.record(entry, &outcome);
        }
        report.entries = entries;
        info!(
            entries = report.entries.len(),
            modified = report.modified,
            failed = report.failed,
            "configured launch entries"
        );
        report
    }

    /// Locate and patch everything without relaunching.
    pub async fn heal(&self) -> RepairReport {
        let entries = self.locate().await;
        self.configure_all(entries).await
    }

    /// Index of the entry to relaunch through.
    pub fn select_primary(entries: &[LaunchEntry]) -> Option<usize> {
        if entries.is_empty() {
            return None;
        }
        entries
            .iter()
            .position(|e| e.kind.is_preferred_primary())
            .or(Some(0))
    }

    /// Relaunch the host so it comes back with the flag.
    pub async fn relaunch(
        &self,
        preferred: Option<&LaunchEntry>,
        workspace_paths: &[PathBuf],
    ) -> RelaunchOutcome {
        info!("Starting relaunch flow");
        if self.already_running().await {
            return RelaunchOutcome::not_needed();
        }

        let entries = self.locate().await;
        self.relaunch_entries(entries, preferred, workspace_paths).await
    }

    /// Same as [`relaunch`](Self::relaunch) with entries the caller already
    /// located. The port is still re-checked first.
    pub async fn relaunch_with(
        &self,
        entries: Vec<LaunchEntry>,
        preferred: Option<&LaunchEntry>,
        workspace_paths: &[PathBuf],
    ) -> RelaunchOutcome {
        info!(entries = entries.len(), "Starting relaunch flow");
        if self.already_running().await {
            return RelaunchOutcome::not_needed();
        }
        self.relaunch_entries(entries, preferred, workspace_paths).await
    }

    // the port may have come up since the caller's probe
    async fn already_running(&self) -> bool {
        let reachable = self.port_reachable().await;
        if reachable {
            info!("Remote debugging already running, no relaunch needed");
        }
        reachable
    }

    /// Patch `entries`, then relaunch through the primary one or directly.
    async fn relaunch_entries(
        &self,
        entries: Vec<LaunchEntry>,
        preferred: Option<&LaunchEntry>,
        workspace_paths: &[PathBuf],
    ) -> RelaunchOutcome {
        if entries.is_empty() && preferred.is_none() {
            info!("No launch entries found to modify");
        } else {
            let report = self.configure_all(entries).await;
            let primary = match preferred {
                Some(wanted) => report
                    .entries
                    .iter()
                    .find(|e| e.path == wanted.path)
                    .cloned()
                    .or_else(|| Some(wanted.clone())),
                None => Self::select_primary(&report.entries).map(|i| report.entries[i].clone()),
            };

            if let Some(mut primary) = primary {
                info!(path = %primary.path.display(), kind = %primary.kind, "Using primary launch entry");
                let outcome = self.environment.patch(&mut primary).await;
                if outcome.success {
                    match self.relaunch_via_entry(&primary, workspace_paths).await {
                        Ok(()) => {
                            let message = if report.modified > 0 {
                                "Launch entries updated. Relaunching with remote debugging enabled..."
                            } else {
                                "Relaunching with remote debugging enabled..."
                            };
                            return RelaunchOutcome::relaunched(message);
                        }
                        Err(e) => warn!("Launch entry relaunch failed: {}", e),
                    }
                } else {
                    warn!("Primary launch entry could not be patched: {}", outcome.message);
                }
            }
        }

        self.relaunch_directly(workspace_paths)
    }

    async fn relaunch_via_entry(
        &self,
        entry: &LaunchEntry,
        workspace_paths: &[PathBuf],
    ) -> Result<(), BootstrapError> {
        let command = self
            .environment
            .prepare_relaunch(entry, workspace_paths)
            .await?;
        self.process.spawn_detached(&command)?;
        self.schedule_quit();
        Ok(())
    }

    /// Last tier: start the running executable with the flag.
    fn relaunch_directly(&self, workspace_paths: &[PathBuf]) -> RelaunchOutcome {
        info!("Initiating direct executable relaunch fallback");
        let Some(executable) = self.process.current_executable() else {
            error!("no launch entry and no resolvable executable");
            return RelaunchOutcome::error(format!(
                "No launch entry found and the host executable could not be determined. \
                 Start the host with {} manually.",
                self.config.debug_flag()
            ));
        };

        let mut args = vec![self.config.debug_flag()];
        args.extend(self.config.compat_args.iter().cloned());
        args.extend(
            workspace_paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned()),
        );
        let command = LaunchCommand::new(executable, args);
        info!(%command, "Spawning direct relaunch");

        match self.process.spawn_detached(&command) {
            Ok(_) => {
                self.schedule_quit();
                RelaunchOutcome::relaunched(
                    "No usable launch entry, relaunching the executable directly...",
                )
            }
            Err(e) => RelaunchOutcome::error(format!("Direct executable relaunch failed: {e}")),
        }
    }

    /// Quit after the spawn has had time to start; never awaited.
    fn schedule_quit(&self) {
        let shell = self.shell.clone();
        DelayedTask::spawn("quit-after-relaunch", self.config.quit_delay(), async move {
            info!("Closing current window for relaunch");
            shell.request_quit().await;
        })
        .detach();
    }
}
