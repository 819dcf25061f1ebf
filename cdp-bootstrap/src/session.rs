//! The per-process session context.
//!
//! One [`Session`] is created when the host starts and is shared by every
//! command handler. It owns the in-memory flags, the polling task and the
//! collaborators; everything that must survive a restart goes through the
//! store.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bootstrap::EnvironmentState;
use crate::clock::{Clock, SystemClock};
use crate::conductor::{RelaunchConductor, RelaunchOutcome};
use crate::config::OrchestratorConfig;
use crate::errors::BootstrapError;
use crate::host::{DriverConfig, HostApp, HostShell, Indicator, MessageLevel, PortDriver};
use crate::lock::InstanceLockArbiter;
use crate::markers::{keys, Markers};
use crate::platforms::{create_environment, LaunchEnvironment};
use crate::probe::{PortCheck, PortProber};
use crate::process::{ProcessControl, SystemProcess};
use crate::scheduler::{DelayedTask, PeriodicTask};
use crate::store::KeyValueStore;

pub const RELAUNCH_NOW: &str = "Relaunch now";
pub const NOT_NOW: &str = "Not now";
const ENABLE: &str = "Enable";
const ENABLE_DONT_ASK: &str = "Enable and don't ask again";
const CANCEL: &str = "Cancel";

/// What the user did with the relaunch prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PromptResult {
    Relaunched,
    Failed,
    Cancelled,
}

/// In-memory session flags. Never persisted as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub enabled: bool,
    pub background_mode: bool,
    pub poll_interval_ms: u64,
    pub blocked_patterns: Vec<String>,
    /// Owned by the bootstrap pass and reset at its start
    pub connection_limited: bool,
    /// The driver reported a connection during this session
    pub had_connection: bool,
    pub standby: bool,
    pub environment: Option<EnvironmentState>,
    pub last_connection_prompt_ms: u64,
}

impl SessionState {
    fn new(config: &OrchestratorConfig) -> Self {
        Self {
            enabled: false,
            background_mode: false,
            poll_interval_ms: config.poll_interval_ms,
            blocked_patterns: config.blocked_patterns.clone(),
            connection_limited: false,
            had_connection: false,
            standby: false,
            environment: None,
            last_connection_prompt_ms: 0,
        }
    }
}

#[derive(Default)]
struct SessionTasks {
    poll: Option<PeriodicTask>,
    self_heal: Option<DelayedTask>,
}

pub struct Session {
    host: HostApp,
    config: OrchestratorConfig,
    shell: Arc<dyn HostShell>,
    driver: Arc<dyn PortDriver>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    markers: Markers,
    arbiter: InstanceLockArbiter,
    conductor: Arc<RelaunchConductor>,
    state: Mutex<SessionState>,
    tasks: Mutex<SessionTasks>,
}

pub struct SessionBuilder {
    host: HostApp,
    config: OrchestratorConfig,
    shell: Option<Arc<dyn HostShell>>,
    driver: Option<Arc<dyn PortDriver>>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    environment: Option<Arc<dyn LaunchEnvironment>>,
    prober: Option<Arc<dyn PortCheck>>,
    process: Option<Arc<dyn ProcessControl>>,
    instance_id: Option<String>,
}

impl SessionBuilder {
    pub fn new(host: HostApp) -> Self {
        Self {
            host,
            config: OrchestratorConfig::default(),
            shell: None,
            driver: None,
            store: None,
            clock: None,
            environment: None,
            prober: None,
            process: None,
            instance_id: None,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn shell(mut self, shell: Arc<dyn HostShell>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn driver(mut self, driver: Arc<dyn PortDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn LaunchEnvironment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn PortCheck>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn process(mut self, process: Arc<dyn ProcessControl>) -> Self {
        self.process = Some(process);
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn build(self) -> Result<Arc<Session>, BootstrapError> {
        let mut config = self.config;
        config.normalize();

        let shell = self
            .shell
            .ok_or_else(|| BootstrapError::InvalidConfig("a host shell is required".into()))?;
        let driver = self
            .driver
            .ok_or_else(|| BootstrapError::InvalidConfig("a port driver is required".into()))?;
        let store = self
            .store
            .ok_or_else(|| BootstrapError::InvalidConfig("a key/value store is required".into()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let environment = match self.environment {
            Some(environment) => environment,
            None => create_environment(&self.host, &config)?,
        };
        let prober = self
            .prober
            .unwrap_or_else(|| Arc::new(PortProber::new()));
        let process = self
            .process
            .unwrap_or_else(|| Arc::new(SystemProcess::embedded(self.host.clone())));

        let arbiter = match self.instance_id {
            Some(id) => InstanceLockArbiter::with_instance_id(
                store.clone(),
                clock.clone(),
                &self.host,
                config.lock_stale_ms,
                id,
            ),
            None => InstanceLockArbiter::new(store.clone(), clock.clone(), &self.host, config.lock_stale_ms),
        };
        let conductor = Arc::new(RelaunchConductor::new(
            environment,
            prober,
            process,
            shell.clone(),
            config.clone(),
        ));

        Ok(Arc::new(Session {
            state: Mutex::new(SessionState::new(&config)),
            tasks: Mutex::new(SessionTasks::default()),
            markers: Markers::new(store.clone()),
            host: self.host,
            config,
            shell,
            driver,
            store,
            clock,
            arbiter,
            conductor,
        }))
    }
}

impl Session {
    pub fn builder(host: HostApp) -> SessionBuilder {
        SessionBuilder::new(host)
    }

    pub fn host(&self) -> &HostApp {
        &self.host
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn conductor(&self) -> &RelaunchConductor {
        &self.conductor
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    pub fn arbiter(&self) -> &InstanceLockArbiter {
        &self.arbiter
    }

    pub(crate) fn shell(&self) -> &Arc<dyn HostShell> {
        &self.shell
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Snapshot of the session flags.
    pub fn state(&self) -> SessionState {
        self.state_mut().clone()
    }

    pub(crate) fn state_mut(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks_mut(&self) -> MutexGuard<'_, SessionTasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_polling(&self) -> bool {
        self.tasks_mut().poll.is_some()
    }

    /// Load persisted preferences into the session.
    pub async fn restore_preferences(&self) {
        let enabled = self.store.get_or(keys::ENABLED, false).await;
        let background_mode = self.store.get_or(keys::BACKGROUND_MODE, false).await;
        let poll_interval_ms = self
            .store
            .get_or(keys::POLL_INTERVAL, self.config.poll_interval_ms)
            .await;
        let blocked_patterns = self
            .store
            .get_or(keys::BLOCKED_PATTERNS, self.config.blocked_patterns.clone())
            .await;

        let mut state = self.state_mut();
        state.enabled = enabled;
        state.background_mode = background_mode;
        state.poll_interval_ms = poll_interval_ms.max(1);
        state.blocked_patterns = blocked_patterns;
        debug!(enabled, background_mode, poll_interval_ms, "restored preferences");
    }

    async fn persist<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(e) = self.store.set(key, value).await {
            warn!(key, "failed to persist preference: {}", e);
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        let state = self.state_mut();
        DriverConfig {
            pro_mode: true,
            background_mode: state.background_mode,
            poll_interval_ms: state.poll_interval_ms,
            host_name: self.host.display_name().to_string(),
            blocked_patterns: state.blocked_patterns.clone(),
        }
    }

    /// Indicator for the current flags; standby and limited states win.
    pub fn current_indicator(&self) -> Indicator {
        let state = self.state_mut();
        if state.standby {
            Indicator::Standby
        } else if state.connection_limited {
            Indicator::ConnectionLimited
        } else if state.environment == Some(EnvironmentState::UnreachableUserSkipped) {
            Indicator::LimitedMode
        } else if state.enabled {
            Indicator::Enabled {
                background_mode: state.background_mode,
            }
        } else {
            Indicator::Disabled
        }
    }

    pub async fn refresh_indicator(&self) {
        let indicator = self.current_indicator();
        self.shell.set_indicator(indicator).await;
    }

    /// Push the current settings to the driver and watch its connection count.
    pub async fn sync_driver(self: &Arc<Self>) {
        if self.state_mut().standby {
            return;
        }
        let config = self.driver_config();
        debug!(background = config.background_mode, "syncing driver");
        if let Err(e) = self.driver.start(config).await {
            warn!("driver sync failed: {}", e);
            return;
        }

        let connections = self.driver.connection_count();
        let now = self.clock.now_ms();
        let prompt = {
            let mut state = self.state_mut();
            if connections > 0 {
                let first = !state.had_connection;
                state.had_connection = true;
                if first {
                    info!(connections, "driver connected");
                }
                false
            } else if state.had_connection && state.enabled {
                let since = now.saturating_sub(state.last_connection_prompt_ms);
                if state.last_connection_prompt_ms == 0
                    || since >= self.config.connection_lost_prompt_cooldown_ms
                {
                    state.last_connection_prompt_ms = now;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if connections > 0 {
            if let Err(e) = self.markers.set_connection_established(true).await {
                debug!("failed to persist connection marker: {}", e);
            }
        }

        if prompt {
            if self.markers.load().await.skip_prompt_requested {
                info!("connection lost, relaunch prompts are switched off");
                return;
            }
            warn!("connection lost, the host may have restarted without remote debugging");
            let session = self.clone();
            tokio::spawn(async move {
                session.prompt_relaunch().await;
            });
        }
    }

    /// One polling tick: arbitrate the lock, then drive if we own it.
    pub async fn poll_tick(self: &Arc<Self>) {
        if !self.state_mut().enabled {
            return;
        }
        let tick = self.arbiter.tick().await;
        if !tick.is_owner() {
            if tick.entered_standby {
                self.state_mut().standby = true;
                self.shell.set_indicator(Indicator::Standby).await;
            }
            return;
        }
        if tick.resumed {
            info!("lock acquired, resuming control");
            self.state_mut().standby = false;
            self.refresh_indicator().await;
        }
        self.sync_driver().await;
    }

    pub async fn start_polling(self: &Arc<Self>) {
        info!("Monitoring session");
        self.poll_tick().await;

        let weak: Weak<Session> = Arc::downgrade(self);
        let task = PeriodicTask::spawn("poll", self.config.heartbeat_interval(), move || {
            let weak = weak.clone();
            async move {
                if let Some(session) = weak.upgrade() {
                    session.poll_tick().await;
                }
            }
        });
        self.tasks_mut().poll = Some(task);
    }

    pub async fn stop_polling(&self) {
        let task = self.tasks_mut().poll.take();
        if let Some(task) = task {
            task.cancel();
        }
        if let Err(e) = self.driver.stop().await {
            warn!("failed to stop driver: {}", e);
        }
        info!("Polling stopped");
    }

    /// Re-patch every entry in the background, without relaunching.
    pub fn schedule_self_heal(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = DelayedTask::spawn("self-heal", self.config.self_heal_delay(), async move {
            let Some(session) = weak.upgrade() else {
                return;
            };
            let report = session.conductor.heal().await;
            if report.modified > 0 {
                info!(modified = report.modified, "self-heal repaired launch entries");
            } else {
                debug!(entries = report.entries.len(), "self-heal found nothing to repair");
            }
        });
        self.tasks_mut().self_heal = Some(task);
    }

    pub async fn enable(self: &Arc<Self>, background_mode: Option<bool>) {
        {
            let mut state = self.state_mut();
            state.enabled = true;
            if let Some(background) = background_mode {
                state.background_mode = background;
            }
        }
        self.persist(keys::ENABLED, &true).await;
        if let Some(background) = background_mode {
            self.persist(keys::BACKGROUND_MODE, &background).await;
        }
        info!("Enabled");
        self.refresh_indicator().await;

        if self.conductor.port_reachable().await {
            self.schedule_self_heal();
        } else if !self.markers.load().await.skip_prompt_requested {
            self.prompt_relaunch().await;
        }
        self.start_polling().await;
    }

    pub async fn disable(&self) {
        {
            let mut state = self.state_mut();
            state.enabled = false;
            state.had_connection = false;
        }
        self.persist(keys::ENABLED, &false).await;
        if let Err(e) = self.markers.set_connection_established(false).await {
            warn!("failed to reset connection marker: {}", e);
        }
        info!("Disabled");

        let summary = self.driver.session_summary().await;
        self.stop_polling().await;
        self.refresh_indicator().await;

        if summary.clicks > 0 || summary.blocked > 0 {
            let message = format!(
                "Session summary: {} actions, {} terminal commands, {} file edits, {} blocked, ~{} min saved.",
                summary.clicks,
                summary.terminal_commands,
                summary.file_edits,
                summary.blocked,
                summary.estimated_time_saved_minutes
            );
            let shell = self.shell.clone();
            tokio::spawn(async move {
                shell.show_message(MessageLevel::Info, &message, &[]).await;
            });
        }
    }

    /// Flip the feature on or off. Returns the new enabled flag.
    pub async fn toggle(self: &Arc<Self>) -> bool {
        if self.state_mut().enabled {
            self.disable().await;
            false
        } else {
            self.enable(None).await;
            true
        }
    }

    /// OFF, then ON for the active tab, then ON for all tabs, then OFF.
    pub async fn cycle_state(self: &Arc<Self>) -> Indicator {
        let (enabled, background) = {
            let state = self.state_mut();
            (state.enabled, state.background_mode)
        };
        if !enabled {
            self.enable(Some(false)).await;
        } else if !background {
            self.state_mut().background_mode = true;
            self.persist(keys::BACKGROUND_MODE, &true).await;
            self.refresh_indicator().await;
            self.sync_driver().await;
        } else {
            self.state_mut().background_mode = false;
            self.persist(keys::BACKGROUND_MODE, &false).await;
            self.disable().await;
        }
        self.current_indicator()
    }

    /// Switch multi-tab mode, confirming the first time it is turned on.
    pub async fn toggle_background(self: &Arc<Self>) -> bool {
        let background = self.state_mut().background_mode;
        if !background {
            let dont_ask = self.store.get_or(keys::BACKGROUND_DONT_SHOW, false).await;
            if !dont_ask {
                let choice = self
                    .shell
                    .show_message(
                        MessageLevel::Info,
                        "Enable multi-tab mode? Every open conversation tab is handled, so tabs may switch quickly while it works.",
                        &[ENABLE, ENABLE_DONT_ASK, CANCEL],
                    )
                    .await;
                match choice.as_deref() {
                    Some(ENABLE) => {}
                    Some(ENABLE_DONT_ASK) => self.persist(keys::BACKGROUND_DONT_SHOW, &true).await,
                    _ => {
                        info!("Background mode cancelled by user");
                        return false;
                    }
                }
            }
        }

        let background = !background;
        self.state_mut().background_mode = background;
        self.persist(keys::BACKGROUND_MODE, &background).await;
        info!(background, "Background mode toggled");
        self.refresh_indicator().await;
        if self.state_mut().enabled {
            self.sync_driver().await;
        }
        background
    }

    pub async fn set_poll_interval(self: &Arc<Self>, interval_ms: u64) {
        let interval_ms = interval_ms.max(1);
        self.state_mut().poll_interval_ms = interval_ms;
        self.persist(keys::POLL_INTERVAL, &interval_ms).await;
        info!(interval_ms, "Poll interval updated");
        if self.state_mut().enabled {
            self.sync_driver().await;
        }
    }

    pub async fn set_blocked_patterns(self: &Arc<Self>, patterns: Vec<String>) {
        info!(count = patterns.len(), "Blocked patterns updated");
        self.persist(keys::BLOCKED_PATTERNS, &patterns).await;
        self.state_mut().blocked_patterns = patterns;
        if self.state_mut().enabled {
            self.sync_driver().await;
        }
    }

    pub fn blocked_patterns(&self) -> Vec<String> {
        self.state_mut().blocked_patterns.clone()
    }

    /// The manual one-click relaunch.
    pub async fn relaunch_now(&self) -> RelaunchOutcome {
        info!("Initiating relaunch");
        let outcome = self
            .conductor
            .relaunch(None, &self.shell.workspace_paths())
            .await;
        if !outcome.success {
            self.shell
                .show_message(
                    MessageLevel::Error,
                    &format!("Relaunch failed: {}", outcome.message),
                    &[],
                )
                .await;
        }
        outcome
    }

    /// Ask before relaunching. "Not now" is remembered across restarts.
    pub async fn prompt_relaunch(&self) -> PromptResult {
        info!("Showing relaunch prompt");
        let message = format!(
            "Remote debugging is not enabled for {}. Relaunch now with {}? Open folders are restored.",
            self.host.display_name(),
            self.config.debug_flag()
        );
        let choice = self
            .shell
            .show_message(MessageLevel::Info, &message, &[RELAUNCH_NOW, NOT_NOW])
            .await;

        match choice.as_deref() {
            Some(RELAUNCH_NOW) => {
                if self.relaunch_now().await.success {
                    PromptResult::Relaunched
                } else {
                    PromptResult::Failed
                }
            }
            Some(NOT_NOW) => {
                if let Err(e) = self.markers.set_skip_prompt(true).await {
                    warn!("failed to remember prompt choice: {}", e);
                }
                PromptResult::Cancelled
            }
            _ => PromptResult::Cancelled,
        }
    }

    /// Forget "Not now" so the next start prompts again.
    pub async fn reset_prompt_preference(&self) -> Result<(), BootstrapError> {
        self.markers.set_skip_prompt(false).await?;
        info!("relaunch prompt preference reset");
        let shell = self.shell.clone();
        tokio::spawn(async move {
            shell
                .show_message(
                    MessageLevel::Info,
                    "Remote debugging setup was reset. You will be asked again on the next start.",
                    &[],
                )
                .await;
        });
        Ok(())
    }

    /// Click on the status indicator.
    pub async fn on_indicator_clicked(self: &Arc<Self>) -> Indicator {
        if self.current_indicator() == Indicator::ConnectionLimited {
            self.relaunch_now().await;
            return self.current_indicator();
        }
        self.cycle_state().await
    }

    pub async fn on_focus_changed(&self, focused: bool) {
        self.driver.set_focus_state(focused).await;
        if !focused || !self.state_mut().enabled {
            return;
        }
        let away = self.driver.away_actions().await;
        if away > 0 {
            info!(away, "actions handled while the window was unfocused");
            let shell = self.shell.clone();
            tokio::spawn(async move {
                shell
                    .show_message(
                        MessageLevel::Info,
                        &format!("{away} actions were handled while you were away."),
                        &[],
                    )
                    .await;
            });
        }
    }

    pub async fn open_settings(&self) {
        self.shell.open_settings().await;
    }

    /// Stop every timer and the driver.
    pub async fn shutdown(&self) {
        let self_heal = self.tasks_mut().self_heal.take();
        if let Some(task) = self_heal {
            task.cancel();
        }
        self.stop_polling().await;
    }
}
