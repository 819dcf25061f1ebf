//! Launch entries and the flag edit shared by every platform.

use std::fmt;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEBUG_PORT_FLAG: &str = "--remote-debugging-port";

static PORT_FLAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--remote-debugging-port=(\d+)").expect("static regex"));

/// `--remote-debugging-port=<port>`
pub fn required_flag(port: u16) -> String {
    format!("{DEBUG_PORT_FLAG}={port}")
}

/// True if the text carries the debug-port flag with any port.
pub fn contains_debug_flag(text: &str) -> bool {
    PORT_FLAG_RE.is_match(text)
}

/// True if the text carries the flag and every occurrence names `port`.
pub fn has_flag_for_port(text: &str, port: u16) -> bool {
    let mut seen = false;
    for caps in PORT_FLAG_RE.captures_iter(text) {
        seen = true;
        if caps[1].parse::<u32>().ok() != Some(u32::from(port)) {
            return false;
        }
    }
    seen
}

/// Result of applying the required flag to an argument string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagEdit {
    /// Flag already present with the right port.
    Unchanged,
    /// A stale port number was substituted in place.
    Replaced(String),
    /// The flag was missing and has been put in front of the other arguments.
    Prepended(String),
}

impl FlagEdit {
    pub fn into_text(self, original: &str) -> String {
        match self {
            FlagEdit::Unchanged => original.to_string(),
            FlagEdit::Replaced(text) | FlagEdit::Prepended(text) => text,
        }
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, FlagEdit::Unchanged)
    }
}

/// Make `args` carry `--remote-debugging-port=<port>`.
///
/// A stale port is replaced through pattern substitution so the rest of the
/// string stays byte-identical; a missing flag is prepended.
pub fn apply_debug_flag(args: &str, port: u16) -> FlagEdit {
    if has_flag_for_port(args, port) {
        return FlagEdit::Unchanged;
    }
    let flag = required_flag(port);
    if contains_debug_flag(args) {
        return FlagEdit::Replaced(PORT_FLAG_RE.replace_all(args, flag.as_str()).into_owned());
    }
    if args.trim().is_empty() {
        FlagEdit::Prepended(flag)
    } else {
        FlagEdit::Prepended(format!("{flag} {args}"))
    }
}

/// Where a launch entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    StartMenu,
    Desktop,
    Taskbar,
    Registry,
    AppBundle,
    WrapperScript,
    DesktopFileUser,
    DesktopFileSystem,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::StartMenu => "start-menu",
            EntryKind::Desktop => "desktop",
            EntryKind::Taskbar => "taskbar",
            EntryKind::Registry => "registry",
            EntryKind::AppBundle => "app-bundle",
            EntryKind::WrapperScript => "wrapper-script",
            EntryKind::DesktopFileUser => "desktop-file-user",
            EntryKind::DesktopFileSystem => "desktop-file-system",
        }
    }

    /// Entries the user most plausibly launches from, tried first for relaunch.
    pub fn is_preferred_primary(&self) -> bool {
        matches!(
            self,
            EntryKind::StartMenu | EntryKind::WrapperScript | EntryKind::DesktopFileUser
        )
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One way the host can be started.
///
/// Built fresh on every locate pass. `has_required_flag` is derived from
/// `argument_string` and refreshed by the patcher after a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Resolved host binary, empty when it could not be read
    pub target_executable: String,
    pub argument_string: String,
    pub has_required_flag: bool,
}

impl LaunchEntry {
    pub fn new(
        path: impl Into<PathBuf>,
        kind: EntryKind,
        target_executable: impl Into<String>,
        argument_string: impl Into<String>,
        port: u16,
    ) -> Self {
        let argument_string = argument_string.into();
        Self {
            path: path.into(),
            kind,
            target_executable: target_executable.into(),
            has_required_flag: has_flag_for_port(&argument_string, port),
            argument_string,
        }
    }

    /// An entry that exists but whose contents could not be read.
    pub fn unreadable(path: impl Into<PathBuf>, kind: EntryKind) -> Self {
        Self {
            path: path.into(),
            kind,
            target_executable: String::new(),
            argument_string: String::new(),
            has_required_flag: false,
        }
    }

    pub fn set_arguments(&mut self, argument_string: impl Into<String>, port: u16) {
        self.argument_string = argument_string.into();
        self.has_required_flag = has_flag_for_port(&self.argument_string, port);
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Structured patch result. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchOutcome {
    pub success: bool,
    pub modified: bool,
    pub message: String,
}

impl PatchOutcome {
    pub fn unchanged(message: impl Into<String>) -> Self {
        Self {
            success: true,
            modified: false,
            message: message.into(),
        }
    }

    pub fn modified(message: impl Into<String>) -> Self {
        Self {
            success: true,
            modified: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            modified: false,
            message: message.into(),
        }
    }
}
