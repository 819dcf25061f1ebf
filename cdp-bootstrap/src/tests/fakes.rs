//! In-memory collaborators for driving a [`Session`] without an OS or a host.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::ManualClock;
use crate::config::OrchestratorConfig;
use crate::entry::{apply_debug_flag, EntryKind, LaunchEntry, PatchOutcome};
use crate::errors::BootstrapError;
use crate::host::{
    DriverConfig, HostApp, HostShell, Indicator, MessageLevel, PortDriver, SessionSummary,
    StatsSnapshot,
};
use crate::platforms::{LaunchCommand, LaunchEnvironment, Platform};
use crate::probe::PortCheck;
use crate::process::ProcessControl;
use crate::session::Session;
use crate::store::{KeyValueStore, MemoryStore};

pub const PORT: u16 = 9000;
pub const START_MS: u64 = 1_700_000_000_000;

#[derive(Default)]
pub struct FakeShell {
    pub messages: Mutex<Vec<(MessageLevel, String, Vec<String>)>>,
    pub indicators: Mutex<Vec<Indicator>>,
    /// Answers for messages that offer choices, consumed in order
    pub answers: Mutex<VecDeque<Option<String>>>,
    pub quits: AtomicUsize,
    pub restarts: AtomicUsize,
    pub settings_opened: AtomicUsize,
    pub workspace: Vec<PathBuf>,
}

impl FakeShell {
    pub fn answer(&self, choice: Option<&str>) {
        self.answers
            .lock()
            .unwrap()
            .push_back(choice.map(str::to_string));
    }

    pub fn prompts(&self) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, choices)| !choices.is_empty())
            .count()
    }

    pub fn messages_containing(&self, needle: &str) -> Vec<(MessageLevel, String)> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, text, _)| text.contains(needle))
            .map(|(level, text, _)| (*level, text.clone()))
            .collect()
    }

    pub fn last_indicator(&self) -> Option<Indicator> {
        self.indicators.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl HostShell for FakeShell {
    async fn show_message(
        &self,
        level: MessageLevel,
        message: &str,
        choices: &[&str],
    ) -> Option<String> {
        self.messages.lock().unwrap().push((
            level,
            message.to_string(),
            choices.iter().map(|c| c.to_string()).collect(),
        ));
        if choices.is_empty() {
            return None;
        }
        self.answers.lock().unwrap().pop_front().flatten()
    }

    async fn set_indicator(&self, indicator: Indicator) {
        self.indicators.lock().unwrap().push(indicator);
    }

    async fn request_quit(&self) {
        self.quits.fetch_add(1, Ordering::SeqCst);
    }

    async fn request_restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    async fn open_settings(&self) {
        self.settings_opened.fetch_add(1, Ordering::SeqCst);
    }

    fn workspace_paths(&self) -> Vec<PathBuf> {
        self.workspace.clone()
    }
}

#[derive(Default)]
pub struct FakeDriver {
    pub connections: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub last_config: Mutex<Option<DriverConfig>>,
    pub focused: Mutex<Option<bool>>,
    pub away: AtomicU64,
    pub summary: Mutex<SessionSummary>,
}

impl FakeDriver {
    pub fn set_connections(&self, count: usize) {
        self.connections.store(count, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortDriver for FakeDriver {
    async fn is_available(&self) -> bool {
        true
    }

    async fn start(&self, config: DriverConfig) -> Result<(), BootstrapError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock().unwrap() = Some(config);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BootstrapError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    async fn session_summary(&self) -> SessionSummary {
        self.summary.lock().unwrap().clone()
    }

    async fn reset_stats(&self) -> StatsSnapshot {
        let summary = std::mem::take(&mut *self.summary.lock().unwrap());
        StatsSnapshot {
            clicks: summary.clicks,
            blocked: summary.blocked,
        }
    }

    async fn away_actions(&self) -> u64 {
        self.away.swap(0, Ordering::SeqCst)
    }

    async fn set_focus_state(&self, focused: bool) {
        *self.focused.lock().unwrap() = Some(focused);
    }
}

#[derive(Default)]
pub struct FakeProbe {
    pub reachable: AtomicBool,
    pub calls: AtomicUsize,
    /// When non-zero, the port opens once this many probes have answered
    pub opens_after: AtomicUsize,
}

impl FakeProbe {
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn open_after(&self, calls: usize) {
        self.opens_after.store(calls, Ordering::SeqCst);
    }
}

#[async_trait]
impl PortCheck for FakeProbe {
    async fn is_reachable(&self, _port: u16, _timeout: Duration) -> bool {
        let previous = self.calls.fetch_add(1, Ordering::SeqCst);
        let opens_after = self.opens_after.load(Ordering::SeqCst);
        if opens_after > 0 && previous >= opens_after {
            return true;
        }
        self.reachable.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeProcess {
    pub executable: Mutex<Option<PathBuf>>,
    pub spawned: Mutex<Vec<LaunchCommand>>,
    pub fail_spawn: AtomicBool,
}

impl FakeProcess {
    pub fn with_executable(path: &str) -> Self {
        let process = Self::default();
        *process.executable.lock().unwrap() = Some(PathBuf::from(path));
        process
    }

    pub fn spawned(&self) -> Vec<LaunchCommand> {
        self.spawned.lock().unwrap().clone()
    }
}

impl ProcessControl for FakeProcess {
    fn current_executable(&self) -> Option<PathBuf> {
        self.executable.lock().unwrap().clone()
    }

    fn spawn_detached(&self, command: &LaunchCommand) -> Result<u32, BootstrapError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(BootstrapError::Spawn("spawn refused".to_string()));
        }
        self.spawned.lock().unwrap().push(command.clone());
        Ok(4242)
    }
}

/// Launch entries kept in memory; `patch` writes back to them like a disk would.
#[derive(Default)]
pub struct FakeEnvironment {
    pub entries: Mutex<Vec<LaunchEntry>>,
    pub locate_calls: AtomicUsize,
    pub patch_calls: AtomicUsize,
    pub prepared: Mutex<Vec<PathBuf>>,
    pub fail_patch: AtomicBool,
    pub fail_prepare: AtomicBool,
}

impl FakeEnvironment {
    pub fn with_entries(entries: Vec<LaunchEntry>) -> Self {
        let environment = Self::default();
        *environment.entries.lock().unwrap() = entries;
        environment
    }

    pub fn reset_entries(&self, entries: Vec<LaunchEntry>) {
        *self.entries.lock().unwrap() = entries;
    }

    pub fn stored(&self) -> Vec<LaunchEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn patch_calls(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }

    pub fn prepared(&self) -> Vec<PathBuf> {
        self.prepared.lock().unwrap().clone()
    }
}

#[async_trait]
impl LaunchEnvironment for FakeEnvironment {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    async fn locate(&self) -> Vec<LaunchEntry> {
        self.locate_calls.fetch_add(1, Ordering::SeqCst);
        self.stored()
    }

    async fn patch(&self, entry: &mut LaunchEntry) -> PatchOutcome {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_patch.load(Ordering::SeqCst) {
            return PatchOutcome::failed("access denied");
        }
        let edit = apply_debug_flag(&entry.argument_string, PORT);
        if !edit.is_change() {
            return PatchOutcome::unchanged("flag already present");
        }
        let text = edit.into_text(&entry.argument_string);
        entry.set_arguments(text.clone(), PORT);
        if let Some(stored) = self
            .entries
            .lock()
            .unwrap()
            .iter_mut()
            .find(|e| e.path == entry.path)
        {
            stored.set_arguments(text, PORT);
        }
        PatchOutcome::modified("flag written")
    }

    async fn prepare_relaunch(
        &self,
        entry: &LaunchEntry,
        _workspace_paths: &[PathBuf],
    ) -> Result<LaunchCommand, BootstrapError> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(BootstrapError::PermissionDenied("temp dir not writable".to_string()));
        }
        self.prepared.lock().unwrap().push(entry.path.clone());
        Ok(LaunchCommand::new(
            "/bin/bash",
            [format!("/tmp/relaunch_{}.sh", entry.file_name())],
        ))
    }
}

pub fn shortcut(name: &str, kind: EntryKind, args: &str) -> LaunchEntry {
    LaunchEntry::new(
        format!("/entries/{name}"),
        kind,
        "/opt/cursor/cursor",
        args,
        PORT,
    )
}

/// Every collaborator of a session, shared so tests can inspect them.
pub struct Harness {
    pub config: OrchestratorConfig,
    pub shell: Arc<FakeShell>,
    pub driver: Arc<FakeDriver>,
    pub probe: Arc<FakeProbe>,
    pub process: Arc<FakeProcess>,
    pub environment: Arc<FakeEnvironment>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(entries: Vec<LaunchEntry>) -> Self {
        super::init_tracing();
        let shell = FakeShell {
            workspace: vec![PathBuf::from("/home/dev/project")],
            ..Default::default()
        };
        Self {
            config: OrchestratorConfig::default(),
            shell: Arc::new(shell),
            driver: Arc::new(FakeDriver::default()),
            probe: Arc::new(FakeProbe::default()),
            process: Arc::new(FakeProcess::with_executable("/opt/cursor/cursor")),
            environment: Arc::new(FakeEnvironment::with_entries(entries)),
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(ManualClock::new(START_MS)),
        }
    }

    pub fn session(&self) -> Arc<Session> {
        self.session_with_id("instance-a")
    }

    pub fn session_with_id(&self, id: &str) -> Arc<Session> {
        Session::builder(HostApp::Cursor)
            .config(self.config.clone())
            .shell(self.shell.clone())
            .driver(self.driver.clone())
            .store(self.store.clone())
            .clock(self.clock.clone())
            .environment(self.environment.clone())
            .prober(self.probe.clone())
            .process(self.process.clone())
            .instance_id(id)
            .build()
            .unwrap()
    }

    pub async fn set<T: serde::Serialize>(&self, key: &str, value: T) {
        self.store.set(key, &value).await.unwrap();
    }

    pub async fn get<T: serde::de::DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.store.get_or(key, default).await
    }
}

/// Poll `condition` until it holds, giving spawned tasks room to run.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
