//! App bundles ignore arguments when launched from Finder or the Dock, so
//! the flag lives in a user-local wrapper script this module generates.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{join_command, make_executable, shell_quote, shell_quote_paths, write_script};
use super::{LaunchCommand, LaunchEnvironment, Platform};
use crate::config::OrchestratorConfig;
use crate::entry::{apply_debug_flag, has_flag_for_port, required_flag, EntryKind, FlagEdit};
use crate::entry::{LaunchEntry, PatchOutcome};
use crate::errors::BootstrapError;
use crate::host::HostApp;

pub struct MacOsEnvironment {
    host: HostApp,
    port: u16,
    grace_secs: u64,
    wrapper_dir: PathBuf,
    applications_dir: PathBuf,
    script_dir: PathBuf,
}

impl MacOsEnvironment {
    pub fn new(host: HostApp, config: &OrchestratorConfig) -> Self {
        let wrapper_dir = dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".local")
            .join("bin");
        Self::with_roots(host, config, wrapper_dir, "/Applications", std::env::temp_dir())
    }

    pub fn with_roots(
        host: HostApp,
        config: &OrchestratorConfig,
        wrapper_dir: impl Into<PathBuf>,
        applications_dir: impl Into<PathBuf>,
        script_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host,
            port: config.port,
            grace_secs: config.relaunch_grace_secs,
            wrapper_dir: wrapper_dir.into(),
            applications_dir: applications_dir.into(),
            script_dir: script_dir.into(),
        }
    }

    pub fn wrapper_path(&self) -> PathBuf {
        self.wrapper_dir.join(format!("{}-cdp", self.host.slug()))
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.applications_dir
            .join(format!("{}.app", self.host.shortcut_name()))
    }

    /// First binary inside the bundle that exists.
    fn resolve_binary(&self, bundle: &Path) -> Option<PathBuf> {
        let candidates = [
            bundle.join("Contents").join("MacOS").join(self.host.shortcut_name()),
            bundle
                .join("Contents")
                .join("Resources")
                .join("app")
                .join("bin")
                .join(self.host.slug()),
            bundle.join("Contents").join("MacOS").join("Electron"),
        ];
        candidates.into_iter().find(|p| p.exists())
    }

    fn wrapper_content(&self) -> String {
        let bundle = self.bundle_path();
        let flag = required_flag(self.port);
        let launch = match self.resolve_binary(&bundle) {
            Some(binary) => format!("exec \"{}\" {flag} \"$@\"", binary.display()),
            None => format!("open -a \"{}\" --args {flag} \"$@\"", bundle.display()),
        };
        format!(
            "#!/bin/bash\n# {} with remote debugging enabled\n{launch}\n",
            self.host.display_name()
        )
    }

    /// Bring the wrapper in line with the required port, creating it if needed.
    fn ensure_wrapper(&self) -> Result<(PathBuf, bool), BootstrapError> {
        let path = self.wrapper_path();
        let existing = match std::fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(BootstrapError::from_io(format!("reading {}", path.display()), e)),
        };

        let content = match existing {
            Some(content) => match apply_debug_flag(&content, self.port) {
                FlagEdit::Unchanged => return Ok((path, false)),
                FlagEdit::Replaced(updated) => updated,
                // no flag anywhere: not a wrapper we can edit in place
                FlagEdit::Prepended(_) => self.wrapper_content(),
            },
            None => self.wrapper_content(),
        };

        std::fs::create_dir_all(&self.wrapper_dir).map_err(|e| {
            BootstrapError::from_io(format!("creating {}", self.wrapper_dir.display()), e)
        })?;
        std::fs::write(&path, content)
            .map_err(|e| BootstrapError::from_io(format!("writing {}", path.display()), e))?;
        make_executable(&path)?;
        Ok((path, true))
    }
}

/// The line of a wrapper that actually launches the host.
fn launch_line(content: &str) -> &str {
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .unwrap_or("")
}

/// Binary exec'd by a wrapper, if it execs one directly.
fn wrapper_target(line: &str) -> String {
    let rest = line.strip_prefix("exec ").unwrap_or(line);
    if rest.starts_with("open ") {
        return String::new();
    }
    let (program, _) = super::split_program(rest);
    super::unquote(program).to_string()
}

fn wrapper_entry(path: &Path, content: &str, port: u16) -> LaunchEntry {
    let line = launch_line(content);
    let mut entry = LaunchEntry::new(path, EntryKind::WrapperScript, wrapper_target(line), line, port);
    entry.has_required_flag = has_flag_for_port(content, port);
    entry
}

#[async_trait]
impl LaunchEnvironment for MacOsEnvironment {
    fn platform(&self) -> Platform {
        Platform::MacOs
    }

    async fn locate(&self) -> Vec<LaunchEntry> {
        let mut entries = Vec::new();

        let wrapper = self.wrapper_path();
        if wrapper.exists() {
            match std::fs::read_to_string(&wrapper) {
                Ok(content) => entries.push(wrapper_entry(&wrapper, &content, self.port)),
                Err(e) => {
                    warn!(path = %wrapper.display(), "cannot read wrapper script: {}", e);
                    entries.push(LaunchEntry::unreadable(&wrapper, EntryKind::WrapperScript));
                }
            }
        }

        let bundle = self.bundle_path();
        if bundle.exists() {
            let binary = self
                .resolve_binary(&bundle)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            // bundles never carry arguments
            entries.push(LaunchEntry::new(&bundle, EntryKind::AppBundle, binary, "", self.port));
        }

        info!("Found {} macOS shortcuts/apps", entries.len());
        entries
    }

    async fn patch(&self, entry: &mut LaunchEntry) -> PatchOutcome {
        if !matches!(entry.kind, EntryKind::WrapperScript | EntryKind::AppBundle) {
            return PatchOutcome::failed(format!("{} entries do not exist on macOS", entry.kind));
        }
        if entry.kind == EntryKind::WrapperScript && entry.has_required_flag {
            return PatchOutcome::unchanged("Already configured with correct port");
        }

        match self.ensure_wrapper() {
            Ok((path, true)) => {
                info!(wrapper = %path.display(), "Created macOS wrapper");
                if entry.kind == EntryKind::WrapperScript {
                    if let Ok(content) = std::fs::read_to_string(&path) {
                        *entry = wrapper_entry(&path, &content, self.port);
                    }
                }
                PatchOutcome::modified(format!(
                    "Created wrapper script. Launch via: {}",
                    path.display()
                ))
            }
            Ok((path, false)) => {
                if entry.kind == EntryKind::WrapperScript {
                    entry.has_required_flag = true;
                }
                PatchOutcome::unchanged(format!("Wrapper already configured: {}", path.display()))
            }
            Err(e) => {
                warn!("Error creating macOS wrapper: {}", e);
                PatchOutcome::failed(e.to_string())
            }
        }
    }

    async fn prepare_relaunch(
        &self,
        entry: &LaunchEntry,
        workspace_paths: &[PathBuf],
    ) -> Result<LaunchCommand, BootstrapError> {
        let folders = shell_quote_paths(workspace_paths);
        let launch = match entry.kind {
            EntryKind::WrapperScript => {
                join_command(&[&shell_quote(&entry.path.to_string_lossy()), &folders])
            }
            _ => join_command(&[
                &format!("open -a {} --args", shell_quote(&entry.path.to_string_lossy())),
                &required_flag(self.port),
                &folders,
            ]),
        };

        let script = format!("#!/bin/bash\nsleep {}\n{launch}\n", self.grace_secs);
        let script_path = write_script(
            &self.script_dir,
            &format!("relaunch_{}", self.host.slug()),
            "sh",
            &script,
        )?;
        info!(script = %script_path.display(), %launch, "Created macOS relaunch script");
        Ok(LaunchCommand::new(
            "/bin/bash",
            [script_path.to_string_lossy().into_owned()],
        ))
    }
}
