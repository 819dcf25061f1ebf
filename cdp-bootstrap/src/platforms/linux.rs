//! `.desktop` entries.
//!
//! User-level files are rewritten in place. System-level files are never
//! touched; a corrected copy goes into the user applications directory,
//! which desktop environments prefer over the system one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{join_command, shell_quote, shell_quote_paths, split_program, unquote, write_script};
use super::{LaunchCommand, LaunchEnvironment, Platform};
use crate::config::OrchestratorConfig;
use crate::entry::{apply_debug_flag, has_flag_for_port, required_flag, EntryKind, FlagEdit};
use crate::entry::{LaunchEntry, PatchOutcome};
use crate::errors::BootstrapError;
use crate::host::HostApp;

static FIELD_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%[fFuUdDnNickvm]").expect("static regex"));

const SYSTEM_APPLICATION_DIRS: &[&str] = &["/usr/share/applications", "/usr/local/share/applications"];

pub struct LinuxEnvironment {
    host: HostApp,
    port: u16,
    grace_secs: u64,
    user_dir: PathBuf,
    system_dirs: Vec<PathBuf>,
    script_dir: PathBuf,
}

impl LinuxEnvironment {
    pub fn new(host: HostApp, config: &OrchestratorConfig) -> Self {
        let user_dir = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("applications");
        let system_dirs = SYSTEM_APPLICATION_DIRS.iter().map(PathBuf::from).collect();
        Self::with_roots(host, config, user_dir, system_dirs, std::env::temp_dir())
    }

    pub fn with_roots(
        host: HostApp,
        config: &OrchestratorConfig,
        user_dir: impl Into<PathBuf>,
        system_dirs: Vec<PathBuf>,
        script_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host,
            port: config.port,
            grace_secs: config.relaunch_grace_secs,
            user_dir: user_dir.into(),
            system_dirs,
            script_dir: script_dir.into(),
        }
    }

    fn desktop_file_name(&self) -> String {
        format!("{}.desktop", self.host.slug())
    }

    fn read_entry(&self, path: &Path, kind: EntryKind) -> LaunchEntry {
        match std::fs::read_to_string(path) {
            Ok(content) => entry_from_desktop(path, kind, &content, self.port),
            Err(e) => {
                warn!(path = %path.display(), "cannot read desktop file: {}", e);
                LaunchEntry::unreadable(path, kind)
            }
        }
    }

    fn patch_file(&self, source: &Path, destination: &Path) -> Result<Option<String>, BootstrapError> {
        let content = std::fs::read_to_string(source)
            .map_err(|e| BootstrapError::from_io(format!("reading {}", source.display()), e))?;
        let Some(patched) = patch_desktop_content(&content, self.port) else {
            return Ok(None);
        };
        if let Some(dir) = destination.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| BootstrapError::from_io(format!("creating {}", dir.display()), e))?;
        }
        std::fs::write(destination, &patched)
            .map_err(|e| BootstrapError::from_io(format!("writing {}", destination.display()), e))?;
        Ok(Some(patched))
    }
}

/// Build an entry from the first `Exec=` line of a desktop file.
fn entry_from_desktop(path: &Path, kind: EntryKind, content: &str, port: u16) -> LaunchEntry {
    let exec_lines: Vec<&str> = exec_values(content).collect();
    let Some(first) = exec_lines.first() else {
        return LaunchEntry::unreadable(path, kind);
    };
    let (program, args) = split_program(first);
    let mut entry = LaunchEntry::new(path, kind, unquote(program), args, port);
    // actions ("New Window") have their own Exec lines and all must carry the flag
    entry.has_required_flag = exec_lines
        .iter()
        .all(|line| has_flag_for_port(split_program(line).1, port));
    entry
}

fn exec_values(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("Exec="))
}

/// Put the flag on every `Exec=` line, right after the program.
///
/// Returns `None` when every line is already correct or there is no `Exec=`
/// line at all.
pub fn patch_desktop_content(content: &str, port: u16) -> Option<String> {
    let mut changed = false;
    let mut out = String::with_capacity(content.len() + 64);
    for line in content.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        let ending = &line[body.len()..];
        let indent = &body[..body.len() - body.trim_start().len()];
        match body.trim_start().strip_prefix("Exec=") {
            Some(value) => {
                let (program, args) = split_program(value);
                let edit = apply_debug_flag(args, port);
                if edit.is_change() {
                    changed = true;
                    let args = edit.into_text(args);
                    out.push_str(indent);
                    out.push_str("Exec=");
                    out.push_str(&join_command(&[program, &args]));
                } else {
                    out.push_str(body);
                }
                out.push_str(ending);
            }
            None => out.push_str(line),
        }
    }
    changed.then_some(out)
}

/// The `Exec` command with desktop field codes removed and the flag applied.
fn launchable_exec(entry: &LaunchEntry, port: u16) -> Option<String> {
    if entry.target_executable.is_empty() {
        return None;
    }
    let stripped = FIELD_CODE_RE.replace_all(&entry.argument_string, "");
    let stripped = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let args = match apply_debug_flag(&stripped, port) {
        FlagEdit::Unchanged => stripped,
        edit => edit.into_text(""),
    };
    let program = if entry.target_executable.contains(' ') {
        format!("\"{}\"", entry.target_executable)
    } else {
        entry.target_executable.clone()
    };
    Some(join_command(&[&program, &args]))
}

#[async_trait]
impl LaunchEnvironment for LinuxEnvironment {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    async fn locate(&self) -> Vec<LaunchEntry> {
        let name = self.desktop_file_name();
        let mut entries = Vec::new();

        let user_path = self.user_dir.join(&name);
        if user_path.exists() {
            entries.push(self.read_entry(&user_path, EntryKind::DesktopFileUser));
        }
        for dir in &self.system_dirs {
            let path = dir.join(&name);
            if path.exists() {
                entries.push(self.read_entry(&path, EntryKind::DesktopFileSystem));
            }
        }

        info!("Found {} Linux .desktop files for {}", entries.len(), self.host.display_name());
        entries
    }

    async fn patch(&self, entry: &mut LaunchEntry) -> PatchOutcome {
        if entry.has_required_flag {
            return PatchOutcome::unchanged("Already configured with correct port");
        }

        let destination = match entry.kind {
            EntryKind::DesktopFileUser => entry.path.clone(),
            EntryKind::DesktopFileSystem => {
                let copy = self.user_dir.join(entry.file_name());
                if copy.exists() {
                    debug!(copy = %copy.display(), "user-level override exists, leaving system file alone");
                    return PatchOutcome::unchanged(format!(
                        "user-level override exists: {}",
                        copy.display()
                    ));
                }
                copy
            }
            other => {
                return PatchOutcome::failed(format!("{other} entries are not desktop files"));
            }
        };

        match self.patch_file(&entry.path, &destination) {
            Ok(Some(content)) => {
                let patched = entry_from_desktop(&destination, EntryKind::DesktopFileUser, &content, self.port);
                *entry = patched;
                info!(path = %destination.display(), "Modified Linux .desktop");
                PatchOutcome::modified(format!("Modified: {}", entry.file_name()))
            }
            Ok(None) if exec_values_missing(&entry.path) => {
                PatchOutcome::failed(format!("{} has no Exec= line", entry.file_name()))
            }
            Ok(None) => {
                entry.has_required_flag = true;
                PatchOutcome::unchanged("Already configured with correct port")
            }
            Err(e) => {
                warn!(path = %entry.path.display(), "Error modifying .desktop: {}", e);
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
        let flag = required_flag(self.port);
        let slug = self.host.slug();
        let desktop_id = entry
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| slug.clone());

        let exec_step = match launchable_exec(entry, self.port) {
            Some(command) => format!("{} 2>/dev/null && exit 0", join_command(&[&command, &folders])),
            None => "# no Exec line available".to_string(),
        };

        let script = format!(
            r#"#!/bin/bash
sleep {grace}

if command -v gio >/dev/null 2>&1; then
    gio launch {path} {folders} 2>/dev/null && exit 0
fi

{exec_step}

if command -v gtk-launch >/dev/null 2>&1; then
    gtk-launch {desktop_id} {folders} 2>/dev/null && exit 0
fi

for bin in "/usr/bin/{slug}" "/usr/share/{slug}/bin/{slug}" "/opt/{slug}/bin/{slug}"; do
    if [ -x "$bin" ]; then
        "$bin" {flag} {folders} &
        exit 0
    fi
done

echo "Failed to launch {name}" >&2
exit 1
"#,
            grace = self.grace_secs,
            path = shell_quote(&entry.path.to_string_lossy()),
            desktop_id = shell_quote(&desktop_id),
            name = self.host.display_name(),
        );

        let script_path = write_script(&self.script_dir, &format!("relaunch_{slug}"), "sh", &script)?;
        info!(script = %script_path.display(), desktop = %entry.path.display(), "Created Linux relaunch script");
        Ok(LaunchCommand::new(
            "/bin/bash",
            [script_path.to_string_lossy().into_owned()],
        ))
    }
}

fn exec_values_missing(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|content| exec_values(&content).next().is_none())
        .unwrap_or(false)
}
