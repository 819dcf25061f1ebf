//! Environment bootstrap and relaunch orchestration for hosts that expose a
//! remote-debugging port only when launched with a command-line flag.
//!
//! The crate finds every launch entry of the host application on the current
//! operating system (shortcuts, registry handlers, desktop files, wrapper
//! scripts), makes sure each one carries `--remote-debugging-port=<port>`, and
//! when the port is still closed relaunches the host with the flag applied.
//! Cross-process coordination goes through a shared [`KeyValueStore`].

pub mod bootstrap;
pub mod clock;
pub mod conductor;
pub mod config;
pub mod entry;
pub mod errors;
pub mod host;
pub mod lock;
pub mod markers;
pub mod platforms;
pub mod probe;
pub mod process;
pub mod scheduler;
pub mod session;
pub mod store;
#[cfg(test)]
mod tests;

pub use bootstrap::{classify, BootstrapReport, EnvironmentState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conductor::{RelaunchAction, RelaunchConductor, RelaunchOutcome, RepairReport};
pub use config::{OrchestratorConfig, DEFAULT_DEBUG_PORT, MIN_RELAUNCH_COOLDOWN_MS};
pub use entry::{EntryKind, FlagEdit, LaunchEntry, PatchOutcome};
pub use errors::BootstrapError;
pub use host::{
    DriverConfig, HostApp, HostShell, Indicator, MessageLevel, PortDriver, SessionSummary,
    StatsSnapshot,
};
pub use lock::{InstanceLock, InstanceLockArbiter, LockRole, LockTick};
pub use markers::{BootstrapMarkers, Markers};
pub use platforms::{create_environment, environment_for, LaunchCommand, LaunchEnvironment, Platform};
pub use probe::{PortCheck, PortProber, TargetInfo};
pub use process::{ProcessControl, SystemProcess};
pub use scheduler::{DelayedTask, PeriodicTask};
pub use session::{PromptResult, Session, SessionBuilder, SessionState};
pub use store::{FileStore, KeyValueStore, MemoryStore};
