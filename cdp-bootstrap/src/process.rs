use std::path::PathBuf;
use std::process::{Command, Stdio};

use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, info};

use crate::errors::BootstrapError;
use crate::host::HostApp;
use crate::platforms::LaunchCommand;

#[cfg(target_os = "windows")]
const DETACHED_PROCESS: u32 = 0x0000_0008;
#[cfg(target_os = "windows")]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Process services used by the relaunch path.
pub trait ProcessControl: Send + Sync {
    /// Path of the running host binary.
    fn current_executable(&self) -> Option<PathBuf>;

    /// Start a process that outlives the current one. Returns its pid.
    fn spawn_detached(&self, command: &LaunchCommand) -> Result<u32, BootstrapError>;
}

pub struct SystemProcess {
    host: HostApp,
    executable_override: Option<PathBuf>,
    embedded: bool,
}

impl SystemProcess {
    /// For a process that is not the host itself: the host binary is found
    /// among running processes or given with [`with_executable`](Self::with_executable).
    pub fn new(host: HostApp) -> Self {
        Self {
            host,
            executable_override: None,
            embedded: false,
        }
    }

    /// For code running inside the host: when no host process is found by
    /// name, the current executable is the host.
    pub fn embedded(host: HostApp) -> Self {
        Self {
            embedded: true,
            ..Self::new(host)
        }
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable_override = Some(path.into());
        self
    }

    /// Look the host up among running processes by name.
    fn find_running_host(&self) -> Option<PathBuf> {
        let wanted: Vec<String> = [self.host.slug(), self.host.shortcut_name().to_lowercase()]
            .into_iter()
            .map(|name| name.replace([' ', '-'], ""))
            .collect();

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let current_pid = std::process::id();
        for (pid, process) in system.processes() {
            if pid.as_u32() == current_pid {
                continue;
            }
            let name = process.name().to_string_lossy().to_lowercase();
            let stem = name.trim_end_matches(".exe").replace([' ', '-'], "");
            // helpers ("Cursor Helper (Renderer)") share the prefix but not the stem
            if !wanted.iter().any(|w| stem == *w) {
                continue;
            }
            if let Some(exe) = process.exe() {
                debug!(pid = pid.as_u32(), exe = %exe.display(), "found running host process");
                return Some(exe.to_path_buf());
            }
        }
        None
    }
}

impl ProcessControl for SystemProcess {
    fn current_executable(&self) -> Option<PathBuf> {
        if let Some(path) = &self.executable_override {
            return Some(path.clone());
        }
        if let Some(path) = self.find_running_host() {
            return Some(path);
        }
        if self.embedded {
            return std::env::current_exe().ok();
        }
        debug!(host = %self.host.display_name(), "host executable not found");
        None
    }

    fn spawn_detached(&self, command: &LaunchCommand) -> Result<u32, BootstrapError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let child = cmd.spawn().map_err(|e| {
            BootstrapError::Spawn(format!("{}: {}", command.program.display(), e))
        })?;
        let pid = child.id();
        info!(pid, program = %command.program.display(), "spawned detached process");
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins() {
        let process = SystemProcess::new(HostApp::Cursor).with_executable("/opt/cursor/cursor");
        assert_eq!(
            process.current_executable(),
            Some(PathBuf::from("/opt/cursor/cursor"))
        );
    }

    #[test]
    fn missing_host_has_no_executable() {
        let process = SystemProcess::new(HostApp::Other("no-such-host-xyz".into()));
        assert_eq!(process.current_executable(), None);
    }

    #[test]
    fn embedded_falls_back_to_the_current_executable() {
        let process = SystemProcess::embedded(HostApp::Other("no-such-host-xyz".into()));
        assert_eq!(process.current_executable(), std::env::current_exe().ok());
    }

    #[cfg(unix)]
    #[test]
    fn spawns_detached_and_reports_missing_program() {
        let process = SystemProcess::new(HostApp::Cursor);
        let pid = process
            .spawn_detached(&LaunchCommand::new("/bin/sh", ["-c", "exit 0"]))
            .unwrap();
        assert!(pid > 0);

        let err = process
            .spawn_detached(&LaunchCommand::new("/definitely/not/here", Vec::<String>::new()))
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Spawn(_)));
    }
}
