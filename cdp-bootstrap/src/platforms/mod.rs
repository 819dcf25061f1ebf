//! Per-OS discovery and repair of launch entries.
//!
//! Each variant implements locate/patch/relaunch preparation on its own and
//! shares only the [`LaunchEntry`] model. All three variants build on every
//! OS so their file handling can be tested anywhere; only the Windows
//! shell-link access is compiled per target.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::entry::{LaunchEntry, PatchOutcome};
use crate::errors::BootstrapError;
use crate::host::HostApp;

pub mod linux;
pub mod macos;
pub mod windows;

pub use self::linux::LinuxEnvironment;
pub use self::macos::MacOsEnvironment;
pub use self::windows::WindowsEnvironment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else if cfg!(target_os = "macos") {
            Some(Platform::MacOs)
        } else if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else {
            None
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
        })
    }
}

/// A detached process to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait LaunchEnvironment: Send + Sync {
    fn platform(&self) -> Platform;

    /// Every launch entry of the host on this system. Entries that exist but
    /// cannot be read are returned with empty fields.
    async fn locate(&self) -> Vec<LaunchEntry>;

    /// Make `entry` carry the required flag. Never fails the caller: OS
    /// errors come back as `success = false`.
    async fn patch(&self, entry: &mut LaunchEntry) -> PatchOutcome;

    /// Write the delayed relaunch script for `entry` and return the command
    /// that runs it.
    async fn prepare_relaunch(
        &self,
        entry: &LaunchEntry,
        workspace_paths: &[PathBuf],
    ) -> Result<LaunchCommand, BootstrapError>;
}

/// Build the environment for a given platform.
pub fn environment_for(
    platform: Platform,
    host: &HostApp,
    config: &OrchestratorConfig,
) -> Arc<dyn LaunchEnvironment> {
    match platform {
        Platform::Windows => Arc::new(WindowsEnvironment::new(host.clone(), config)),
        Platform::MacOs => Arc::new(MacOsEnvironment::new(host.clone(), config)),
        Platform::Linux => Arc::new(LinuxEnvironment::new(host.clone(), config)),
    }
}

/// Build the environment for the current platform
pub fn create_environment(
    host: &HostApp,
    config: &OrchestratorConfig,
) -> Result<Arc<dyn LaunchEnvironment>, BootstrapError> {
    match Platform::current() {
        Some(platform) => {
            debug!(%platform, host = host.display_name(), "creating launch environment");
            Ok(environment_for(platform, host, config))
        }
        None => Err(BootstrapError::UnsupportedPlatform(
            "Current platform is not supported".to_string(),
        )),
    }
}

/// One bash word: single-quoted, with embedded `'` closed and reopened.
pub(crate) fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// `'a' 'b c'`, each path a single bash word.
pub(crate) fn shell_quote_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| shell_quote(&p.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text inside a batch file; `%` would start a variable expansion.
pub(crate) fn batch_escape(text: &str) -> String {
    text.replace('%', "%%")
}

/// `"a" "b c"`, each path double-quoted for a batch file.
pub(crate) fn batch_quote_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("\"{}\"", batch_escape(&p.to_string_lossy())))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Join non-empty command fragments with single spaces.
pub(crate) fn join_command(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Write a uniquely named script into `dir`, executable on unix.
pub(crate) fn write_script(
    dir: &Path,
    prefix: &str,
    extension: &str,
    content: &str,
) -> Result<PathBuf, BootstrapError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| BootstrapError::from_io(format!("creating {}", dir.display()), e))?;
    let unique = uuid::Uuid::new_v4().simple().to_string();
    let name = format!("{}_{}.{}", prefix, &unique[..12], extension);
    let path = dir.join(name);

    let mut file = std::fs::File::create(&path)
        .map_err(|e| BootstrapError::from_io(format!("creating {}", path.display()), e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| BootstrapError::from_io(format!("writing {}", path.display()), e))?;
    drop(file);
    make_executable(&path)?;

    debug!(path = %path.display(), "wrote relaunch script");
    Ok(path)
}

#[cfg(unix)]
pub(crate) fn make_executable(path: &Path) -> Result<(), BootstrapError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| BootstrapError::from_io(format!("chmod {}", path.display()), e))
}

#[cfg(not(unix))]
pub(crate) fn make_executable(_path: &Path) -> Result<(), BootstrapError> {
    Ok(())
}

/// Program token at the start of a command line, with the remainder.
///
/// A quoted program keeps its quotes in the first half so the line can be
/// reassembled byte for byte.
pub(crate) fn split_program(command: &str) -> (&str, &str) {
    let trimmed = command.trim_start();
    let lead = command.len() - trimmed.len();
    let end = if let Some(rest) = trimmed.strip_prefix('"') {
        match rest.find('"') {
            Some(close) => close + 2,
            None => trimmed.len(),
        }
    } else {
        trimmed.find(char::is_whitespace).unwrap_or(trimmed.len())
    };
    let (program, rest) = command.split_at(lead + end);
    (program, rest.trim_start())
}

pub(crate) fn unquote(token: &str) -> &str {
    token.trim().trim_matches('"')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quoted_and_bare_programs() {
        assert_eq!(
            split_program("\"C:\\Program Files\\Cursor\\Cursor.exe\" \"%1\""),
            ("\"C:\\Program Files\\Cursor\\Cursor.exe\"", "\"%1\"")
        );
        assert_eq!(
            split_program("/usr/share/code/code --unity-launch %F"),
            ("/usr/share/code/code", "--unity-launch %F")
        );
        assert_eq!(split_program("cursor"), ("cursor", ""));
        assert_eq!(unquote("\"C:\\a b\\c.exe\""), "C:\\a b\\c.exe");
    }

    #[test]
    fn quotes_workspace_paths() {
        let paths = vec![PathBuf::from("/home/u/my project"), PathBuf::from("/tmp/x")];
        assert_eq!(shell_quote_paths(&paths), "'/home/u/my project' '/tmp/x'");
        assert_eq!(shell_quote_paths(&[]), "");
        assert_eq!(join_command(&["a", "", " b "]), "a b");
    }

    #[test]
    fn shell_words_keep_metacharacters_literal() {
        let paths = vec![PathBuf::from("/tmp/$HOME `id` \"q\" it's")];
        assert_eq!(
            shell_quote_paths(&paths),
            r#"'/tmp/$HOME `id` "q" it'\''s'"#
        );
    }

    #[cfg(unix)]
    #[test]
    fn bash_reads_quoted_paths_back_verbatim() {
        let raw = "/tmp/$HOME `echo x` \"q\" it's 100%";
        let script = format!("printf '%s' {}", shell_quote(raw));
        let output = std::process::Command::new("/bin/bash")
            .args(["-c", &script])
            .output()
            .unwrap();
        assert_eq!(String::from_utf8(output.stdout).unwrap(), raw);
    }

    #[test]
    fn batch_paths_double_percent_signs() {
        let paths = vec![PathBuf::from(r"D:\100% done\%PATH%")];
        assert_eq!(batch_quote_paths(&paths), r#""D:\100%% done\%%PATH%%""#);
    }

    #[test]
    fn scripts_get_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_script(dir.path(), "relaunch_cursor", "sh", "#!/bin/bash\n").unwrap();
        let b = write_script(dir.path(), "relaunch_cursor", "sh", "#!/bin/bash\n").unwrap();
        assert_ne!(a, b);
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "#!/bin/bash\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&a).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn current_platform_builds_an_environment() {
        let config = OrchestratorConfig::default();
        let env = create_environment(&HostApp::Cursor, &config).unwrap();
        assert_eq!(Some(env.platform()), Platform::current());
    }
}
