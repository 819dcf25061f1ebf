//! The start-up state machine.
//!
//! Runs once per process. Decides from one probe and the persisted markers
//! whether the environment is usable, needs first-run setup, was skipped by
//! the user, or looks configured but bypassed, and acts on that decision.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::conductor::{RelaunchAction, RelaunchOutcome, RepairReport};
use crate::host::MessageLevel;
use crate::markers::BootstrapMarkers;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentState {
    Available,
    UnreachableFirstRun,
    UnreachableUserSkipped,
    UnreachableRegistryStaleOrBypassed,
    UnreachableConnectionLimited,
}

impl EnvironmentState {
    pub fn is_available(&self) -> bool {
        matches!(self, EnvironmentState::Available)
    }
}

/// Initial classification from a probe result and the stored markers.
///
/// A configured registry is checked before a skip request, so a user who
/// declined a prompt after setup still gets the cooldown-gated repair.
pub fn classify(reachable: bool, markers: &BootstrapMarkers) -> EnvironmentState {
    if reachable {
        EnvironmentState::Available
    } else if markers.registry_configured {
        EnvironmentState::UnreachableRegistryStaleOrBypassed
    } else if markers.skip_prompt_requested {
        EnvironmentState::UnreachableUserSkipped
    } else {
        EnvironmentState::UnreachableFirstRun
    }
}

/// What one bootstrap pass decided and did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub state: EnvironmentState,
    pub relaunch: Option<RelaunchOutcome>,
    pub repair: Option<RepairReport>,
    pub connection_limited: bool,
    /// A replacement process was spawned and this one is about to quit
    pub exiting: bool,
}

impl BootstrapReport {
    fn new(state: EnvironmentState) -> Self {
        Self {
            state,
            relaunch: None,
            repair: None,
            connection_limited: false,
            exiting: false,
        }
    }
}

impl Session {
    /// Run the start-up pass: probe, classify, repair or relaunch as needed,
    /// then start polling when the feature is enabled.
    pub async fn bootstrap(self: &Arc<Self>) -> BootstrapReport {
        self.state_mut().connection_limited = false;
        self.restore_preferences().await;

        let reachable = self.conductor().port_reachable().await;
        let markers = self.markers().load().await;
        let state = classify(reachable, &markers);
        info!(
            ?state,
            port = self.config().port,
            registry_configured = markers.registry_configured,
            skip_prompt = markers.skip_prompt_requested,
            "bootstrap classified environment"
        );

        let report = match state {
            EnvironmentState::Available => self.bootstrap_available(markers).await,
            EnvironmentState::UnreachableFirstRun => self.bootstrap_first_run().await,
            EnvironmentState::UnreachableUserSkipped => {
                info!("setup was skipped by the user, running in limited mode");
                BootstrapReport::new(state)
            }
            EnvironmentState::UnreachableRegistryStaleOrBypassed => {
                self.bootstrap_stale(markers).await
            }
            EnvironmentState::UnreachableConnectionLimited => BootstrapReport::new(state),
        };

        {
            let mut session = self.state_mut();
            session.environment = Some(report.state);
            session.connection_limited = report.connection_limited;
        }

        if !report.exiting && self.state().enabled {
            self.start_polling().await;
        }
        self.refresh_indicator().await;
        report
    }

    async fn bootstrap_available(self: &Arc<Self>, markers: BootstrapMarkers) -> BootstrapReport {
        if !markers.registry_configured {
            self.markers().try_set_registry_configured().await;
        }
        info!("remote debugging is available");
        if self.state().enabled {
            self.schedule_self_heal();
        }
        BootstrapReport::new(EnvironmentState::Available)
    }

    async fn bootstrap_first_run(self: &Arc<Self>) -> BootstrapReport {
        info!("first run, configuring launch entries");
        let shell = self.shell().clone();
        let message = format!(
            "Setting up {} for remote debugging. The window will restart once.",
            self.host().display_name()
        );
        tokio::spawn(async move {
            shell.show_message(MessageLevel::Info, &message, &[]).await;
        });

        let entries = self.conductor().locate().await;
        let repair = self.conductor().configure_all(entries).await;
        self.markers().try_set_registry_configured().await;

        let outcome = self
            .conductor()
            .relaunch_with(repair.entries.clone(), None, &self.shell().workspace_paths())
            .await;

        let mut report = BootstrapReport::new(EnvironmentState::UnreachableFirstRun);
        match outcome.action {
            RelaunchAction::Relaunched => report.exiting = true,
            RelaunchAction::None => report.state = EnvironmentState::Available,
            RelaunchAction::Error => {
                error!("first-run relaunch failed: {}", outcome.message);
                self.state_mut().enabled = false;
                report.state = EnvironmentState::UnreachableConnectionLimited;
                report.connection_limited = true;
                let shell = self.shell().clone();
                let message = format!(
                    "Could not relaunch automatically. Close the host and start it with {} \
                     (edit its shortcut to add the flag), then reopen.",
                    self.config().debug_flag()
                );
                tokio::spawn(async move {
                    shell.show_message(MessageLevel::Warning, &message, &[]).await;
                });
            }
        }
        report.repair = Some(repair);
        report.relaunch = Some(outcome);
        report
    }

    async fn bootstrap_stale(self: &Arc<Self>, markers: BootstrapMarkers) -> BootstrapReport {
        let mut report = BootstrapReport::new(EnvironmentState::UnreachableRegistryStaleOrBypassed);
        report.connection_limited = true;

        let now = self.clock().now_ms();
        if !markers.cooldown_elapsed(now, self.config().relaunch_cooldown_ms) {
            info!(
                last = markers.last_auto_relaunch_ms,
                "auto-relaunch cooldown active, offering manual relaunch"
            );
            return report;
        }

        // stamp before attempting; a crash mid-attempt must not retry
        if let Err(e) = self.markers().stamp_auto_relaunch(now).await {
            warn!("could not stamp auto-relaunch, skipping it: {}", e);
            return report;
        }

        let repair = self.conductor().heal().await;
        if repair.modified == 0 {
            info!("launch entries already carry the flag, the host was started another way");
            report.repair = Some(repair);
            return report;
        }

        info!(modified = repair.modified, "repaired launch entries, relaunching once");
        let outcome = self
            .conductor()
            .relaunch(None, &self.shell().workspace_paths())
            .await;
        match outcome.action {
            RelaunchAction::Relaunched => {
                report.exiting = true;
                report.connection_limited = false;
            }
            RelaunchAction::None => {
                report.state = EnvironmentState::Available;
                report.connection_limited = false;
            }
            RelaunchAction::Error => {
                warn!("auto-relaunch failed: {}", outcome.message);
                report.state = EnvironmentState::UnreachableConnectionLimited;
            }
        }
        report.repair = Some(repair);
        report.relaunch = Some(outcome);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers(registry_configured: bool, skip: bool) -> BootstrapMarkers {
        BootstrapMarkers {
            registry_configured,
            skip_prompt_requested: skip,
            ..Default::default()
        }
    }

    #[test]
    fn reachable_port_is_always_available() {
        assert_eq!(classify(true, &markers(false, false)), EnvironmentState::Available);
        assert_eq!(classify(true, &markers(true, true)), EnvironmentState::Available);
    }

    #[test]
    fn unreachable_port_classification() {
        assert_eq!(
            classify(false, &markers(false, false)),
            EnvironmentState::UnreachableFirstRun
        );
        assert_eq!(
            classify(false, &markers(true, false)),
            EnvironmentState::UnreachableRegistryStaleOrBypassed
        );
        assert_eq!(
            classify(false, &markers(true, true)),
            EnvironmentState::UnreachableRegistryStaleOrBypassed
        );
        assert_eq!(
            classify(false, &markers(false, true)),
            EnvironmentState::UnreachableUserSkipped
        );
    }
}
