//! Shortcuts and registry handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{batch_escape, batch_quote_paths, join_command, unquote, write_script};
use super::{LaunchCommand, LaunchEnvironment, Platform};
use crate::config::OrchestratorConfig;
use crate::entry::{apply_debug_flag, EntryKind, FlagEdit, LaunchEntry, PatchOutcome};
use crate::errors::BootstrapError;
use crate::host::HostApp;

pub mod registry;
pub mod shell_link;

pub use self::registry::{RegExe, RegistryStore};
pub use self::shell_link::{ComShellLinks, ShellLinkInfo, ShellLinkStore};

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""?%[0-9*lL]"?"#).expect("static regex"));

/// Folders holding the host's shortcuts.
#[derive(Debug, Clone)]
pub struct ShortcutRoots {
    /// `Start Menu\Programs`
    pub start_menu: PathBuf,
    pub desktop: PathBuf,
    /// The taskbar pin cache
    pub taskbar: PathBuf,
}

impl ShortcutRoots {
    pub fn from_profile() -> Self {
        let roaming = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
        let desktop = dirs::desktop_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join("Desktop")))
            .unwrap_or_else(std::env::temp_dir);
        Self {
            start_menu: roaming
                .join("Microsoft")
                .join("Windows")
                .join("Start Menu")
                .join("Programs"),
            desktop,
            taskbar: roaming
                .join("Microsoft")
                .join("Internet Explorer")
                .join("Quick Launch")
                .join("User Pinned")
                .join("TaskBar"),
        }
    }
}

pub struct WindowsEnvironment {
    host: HostApp,
    port: u16,
    grace_secs: u64,
    roots: ShortcutRoots,
    script_dir: PathBuf,
    links: Arc<dyn ShellLinkStore>,
    registry: Arc<dyn RegistryStore>,
}

impl WindowsEnvironment {
    pub fn new(host: HostApp, config: &OrchestratorConfig) -> Self {
        Self::with_stores(
            host,
            config,
            ShortcutRoots::from_profile(),
            std::env::temp_dir(),
            Arc::new(ComShellLinks),
            Arc::new(RegExe),
        )
    }

    pub fn with_stores(
        host: HostApp,
        config: &OrchestratorConfig,
        roots: ShortcutRoots,
        script_dir: impl Into<PathBuf>,
        links: Arc<dyn ShellLinkStore>,
        registry: Arc<dyn RegistryStore>,
    ) -> Self {
        Self {
            host,
            port: config.port,
            grace_secs: config.relaunch_grace_secs,
            roots,
            script_dir: script_dir.into(),
            links,
            registry,
        }
    }

    fn shortcut_candidates(&self) -> Vec<(PathBuf, EntryKind)> {
        let name = self.host.shortcut_name();
        let file = format!("{name}.lnk");
        vec![
            (
                self.roots.start_menu.join(name).join(&file),
                EntryKind::StartMenu,
            ),
            (self.roots.start_menu.join(&file), EntryKind::StartMenu),
            (self.roots.desktop.join(&file), EntryKind::Desktop),
            (self.roots.taskbar.join(&file), EntryKind::Taskbar),
        ]
    }

    async fn read_link(&self, path: PathBuf) -> Result<ShellLinkInfo, BootstrapError> {
        let links = self.links.clone();
        blocking(move || links.read(&path)).await
    }

    async fn read_registry(&self, key: String) -> Result<Option<String>, BootstrapError> {
        let registry = self.registry.clone();
        blocking(move || registry.read_default(&key)).await
    }

    async fn patch_shortcut(&self, entry: &mut LaunchEntry) -> Result<PatchOutcome, BootstrapError> {
        // read-modify-save against the file, not the possibly stale entry
        let current = self.read_link(entry.path.clone()).await?;
        let (arguments, verb) = match apply_debug_flag(&current.arguments, self.port) {
            FlagEdit::Unchanged => {
                entry.set_arguments(current.arguments, self.port);
                return Ok(PatchOutcome::unchanged("Already configured with correct port"));
            }
            FlagEdit::Replaced(args) => (args, "Updated port"),
            FlagEdit::Prepended(args) => (args, "Modified"),
        };

        let links = self.links.clone();
        let path = entry.path.clone();
        let to_write = arguments.clone();
        blocking(move || links.write_arguments(&path, &to_write)).await?;

        entry.set_arguments(arguments, self.port);
        if entry.target_executable.is_empty() {
            entry.target_executable = current.target;
        }
        info!(path = %entry.path.display(), "{} shortcut", verb);
        Ok(PatchOutcome::modified(format!("{verb}: {}", entry.file_name())))
    }

    async fn patch_handler(&self, entry: &mut LaunchEntry) -> Result<PatchOutcome, BootstrapError> {
        let key = entry.path.to_string_lossy().into_owned();
        let Some(command) = self.read_registry(key.clone()).await? else {
            return Ok(PatchOutcome::failed(format!("registry key missing: {key}")));
        };
        let updated = match registry::patch_registry_command(&command, self.port) {
            FlagEdit::Unchanged => {
                entry.has_required_flag = true;
                return Ok(PatchOutcome::unchanged("Already configured with correct port"));
            }
            edit => edit.into_text(&command),
        };

        let store = self.registry.clone();
        let (write_key, value) = (key.clone(), updated.clone());
        blocking(move || store.write_default(&write_key, &value)).await?;

        let (_, args) = registry::split_handler(&updated);
        entry.set_arguments(args, self.port);
        info!(key = %key, "Updated registry handler");
        Ok(PatchOutcome::modified(format!("Updated handler: {key}")))
    }
}

async fn blocking<T, F>(f: F) -> Result<T, BootstrapError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BootstrapError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BootstrapError::Internal(format!("blocking task failed: {e}")))?
}

/// Arguments to hand the target on relaunch: placeholders removed, flag applied.
fn relaunch_arguments(args: &str, port: u16) -> String {
    let stripped = PLACEHOLDER_RE.replace_all(args, "");
    let stripped = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    // a bare `--` would turn the workspace paths into file arguments
    let stripped = stripped.trim_end_matches("--").trim_end().to_string();
    match apply_debug_flag(&stripped, port) {
        FlagEdit::Unchanged => stripped,
        edit => edit.into_text(""),
    }
}

fn is_shortcut_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("lnk"))
        .unwrap_or(false)
}

#[async_trait]
impl LaunchEnvironment for WindowsEnvironment {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    async fn locate(&self) -> Vec<LaunchEntry> {
        let mut entries = Vec::new();

        for (path, kind) in self.shortcut_candidates() {
            if !path.exists() {
                continue;
            }
            match self.read_link(path.clone()).await {
                Ok(info) => {
                    debug!(path = %path.display(), args = %info.arguments, "read shortcut");
                    entries.push(LaunchEntry::new(&path, kind, info.target, info.arguments, self.port));
                }
                Err(e) => {
                    warn!(path = %path.display(), "Error reading shortcut: {}", e);
                    entries.push(LaunchEntry::unreadable(&path, kind));
                }
            }
        }

        for key in registry::command_keys(&self.host) {
            match self.read_registry(key.clone()).await {
                Ok(Some(command)) => {
                    let (program, args) = registry::split_handler(&command);
                    entries.push(LaunchEntry::new(
                        PathBuf::from(&key),
                        EntryKind::Registry,
                        unquote(program),
                        args,
                        self.port,
                    ));
                }
                Ok(None) => {}
                Err(e) => debug!(key = %key, "registry query failed: {}", e),
            }
        }

        info!("Found {} Windows launch entries", entries.len());
        entries
    }

    async fn patch(&self, entry: &mut LaunchEntry) -> PatchOutcome {
        if entry.has_required_flag {
            return PatchOutcome::unchanged("Already configured with correct port");
        }
        let result = match entry.kind {
            EntryKind::StartMenu | EntryKind::Desktop | EntryKind::Taskbar => {
                self.patch_shortcut(entry).await
            }
            EntryKind::Registry => self.patch_handler(entry).await,
            other => Ok(PatchOutcome::failed(format!(
                "{other} entries do not exist on Windows"
            ))),
        };
        result.unwrap_or_else(|e| {
            warn!(path = %entry.path.display(), "Error modifying launch entry: {}", e);
            PatchOutcome::failed(e.to_string())
        })
    }

    async fn prepare_relaunch(
        &self,
        entry: &LaunchEntry,
        workspace_paths: &[PathBuf],
    ) -> Result<LaunchCommand, BootstrapError> {
        let folders = batch_quote_paths(workspace_paths);
        let target = entry.target_executable.trim();

        let command_line = if target.is_empty() || is_shortcut_path(target) {
            if entry.kind == EntryKind::Registry {
                return Err(BootstrapError::EntryUnreadable(format!(
                    "no executable resolved for {}",
                    entry.path.display()
                )));
            }
            debug!("could not resolve executable, starting the shortcut itself");
            join_command(&[
                &format!("start \"\" \"{}\"", batch_escape(&entry.path.to_string_lossy())),
                &folders,
            ])
        } else {
            join_command(&[
                &format!("start \"\" \"{}\"", batch_escape(target)),
                &relaunch_arguments(&entry.argument_string, self.port),
                &folders,
            ])
        };

        let script = format!(
            "@echo off\r\ntimeout /t {} /nobreak >nul\r\n{}\r\ndel \"%~f0\" & exit\r\n",
            self.grace_secs, command_line
        );
        let prefix = format!(
            "relaunch_{}",
            self.host.shortcut_name().split_whitespace().collect::<Vec<_>>().join("_")
        );
        let batch = write_script(&self.script_dir, &prefix, "bat", &script)?;
        info!(batch = %batch.display(), command = %command_line, "Created relaunch batch");

        // explorer detaches the batch from the host's process tree
        Ok(LaunchCommand::new(
            "explorer.exe",
            [batch.to_string_lossy().into_owned()],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeLinks {
        links: Mutex<HashMap<PathBuf, ShellLinkInfo>>,
        writes: Mutex<usize>,
    }

    impl ShellLinkStore for FakeLinks {
        fn read(&self, path: &Path) -> Result<ShellLinkInfo, BootstrapError> {
            self.links
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| BootstrapError::EntryUnreadable(path.display().to_string()))
        }

        fn write_arguments(&self, path: &Path, arguments: &str) -> Result<(), BootstrapError> {
            *self.writes.lock().unwrap() += 1;
            let mut links = self.links.lock().unwrap();
            let link = links
                .get_mut(path)
                .ok_or_else(|| BootstrapError::PermissionDenied(path.display().to_string()))?;
            link.arguments = arguments.to_string();
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRegistry {
        values: Mutex<HashMap<String, String>>,
    }

    impl RegistryStore for FakeRegistry {
        fn read_default(&self, key: &str) -> Result<Option<String>, BootstrapError> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }

        fn write_default(&self, key: &str, value: &str) -> Result<(), BootstrapError> {
            self.values
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
    }

    struct Fixture {
        root: TempDir,
        links: Arc<FakeLinks>,
        registry: Arc<FakeRegistry>,
        env: WindowsEnvironment,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let roots = ShortcutRoots {
            start_menu: root.path().join("Programs"),
            desktop: root.path().join("Desktop"),
            taskbar: root.path().join("TaskBar"),
        };
        let links = Arc::new(FakeLinks::default());
        let registry = Arc::new(FakeRegistry::default());
        let env = WindowsEnvironment::with_stores(
            HostApp::Cursor,
            &OrchestratorConfig::default(),
            roots,
            root.path().join("scripts"),
            links.clone(),
            registry.clone(),
        );
        Fixture {
            root,
            links,
            registry,
            env,
        }
    }

    fn add_link(f: &Fixture, relative: &str, info: Option<ShellLinkInfo>) -> PathBuf {
        let path = f.root.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"").unwrap();
        if let Some(info) = info {
            f.links.links.lock().unwrap().insert(path.clone(), info);
        }
        path
    }

    const EXE: &str = r"C:\Users\me\AppData\Local\Programs\cursor\Cursor.exe";

    #[tokio::test]
    async fn locates_shortcuts_and_handlers() {
        let f = fixture();
        add_link(
            &f,
            "Programs/Cursor/Cursor.lnk",
            Some(ShellLinkInfo {
                target: EXE.into(),
                arguments: String::new(),
            }),
        );
        add_link(&f, "Desktop/Cursor.lnk", None);
        f.registry.values.lock().unwrap().insert(
            r"HKCU\Software\Classes\cursor-url\shell\open\command".into(),
            format!("\"{EXE}\" --open-url -- \"%1\""),
        );

        let entries = f.env.locate().await;
        let kinds: Vec<_> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EntryKind::StartMenu, EntryKind::Desktop, EntryKind::Registry]);

        // unreadable shortcut is reported, not dropped
        assert!(entries[1].target_executable.is_empty());
        assert_eq!(entries[2].target_executable, EXE);
        assert_eq!(entries[2].argument_string, "--open-url -- \"%1\"");
    }

    #[tokio::test]
    async fn shortcut_patch_is_idempotent() {
        let f = fixture();
        add_link(
            &f,
            "Programs/Cursor/Cursor.lnk",
            Some(ShellLinkInfo {
                target: EXE.into(),
                arguments: "--disable-extensions".into(),
            }),
        );

        let mut entry = f.env.locate().await.remove(0);
        let first = f.env.patch(&mut entry).await;
        assert!(first.success && first.modified, "{first:?}");
        assert_eq!(entry.argument_string, "--remote-debugging-port=9000 --disable-extensions");
        assert!(entry.has_required_flag);

        let mut again = f.env.locate().await.remove(0);
        let second = f.env.patch(&mut again).await;
        assert!(second.success && !second.modified);
        assert_eq!(*f.links.writes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn handler_patch_keeps_placeholder() {
        let f = fixture();
        let key = r"HKCU\Software\Classes\cursor\shell\open\command".to_string();
        f.registry
            .values
            .lock()
            .unwrap()
            .insert(key.clone(), format!("\"{EXE}\" \"%1\""));

        let mut entry = f.env.locate().await.remove(0);
        let outcome = f.env.patch(&mut entry).await;
        assert!(outcome.modified);
        assert_eq!(
            f.registry.values.lock().unwrap()[&key],
            format!("\"{EXE}\" --remote-debugging-port=9000 \"%1\"")
        );
    }

    #[tokio::test]
    async fn failed_write_is_reported_not_raised() {
        let f = fixture();
        let path = add_link(&f, "TaskBar/Cursor.lnk", None);
        let mut entry = LaunchEntry::new(&path, EntryKind::Taskbar, EXE, "", 9000);
        let outcome = f.env.patch(&mut entry).await;
        assert!(!outcome.success);
        assert!(!outcome.modified);
    }

    #[tokio::test]
    async fn relaunch_batch_starts_target_with_flag() {
        let f = fixture();
        let entry = LaunchEntry::new(
            f.root.path().join("Programs/Cursor.lnk"),
            EntryKind::StartMenu,
            EXE,
            "--remote-debugging-port=9000",
            9000,
        );
        let command = f
            .env
            .prepare_relaunch(&entry, &[PathBuf::from(r"D:\src\app")])
            .await
            .unwrap();
        assert_eq!(command.program, PathBuf::from("explorer.exe"));

        let batch = std::fs::read_to_string(&command.args[0]).unwrap();
        assert!(batch.starts_with("@echo off\r\ntimeout /t "));
        assert!(batch.contains(&format!(
            "start \"\" \"{EXE}\" --remote-debugging-port=9000 \"D:\\src\\app\"\r\n"
        )));
        assert!(batch.contains("del \"%~f0\" & exit"));
    }

    #[tokio::test]
    async fn relaunch_batch_escapes_percent_in_workspaces() {
        let f = fixture();
        let entry = LaunchEntry::new(
            f.root.path().join("Programs/Cursor.lnk"),
            EntryKind::StartMenu,
            EXE,
            "",
            9000,
        );
        let command = f
            .env
            .prepare_relaunch(&entry, &[PathBuf::from(r"D:\work\50% off\%USERNAME%")])
            .await
            .unwrap();
        let batch = std::fs::read_to_string(&command.args[0]).unwrap();
        assert!(batch.contains(r#" "D:\work\50%% off\%%USERNAME%%""#));
        assert!(!batch.contains(r#"\%USERNAME%""#));
    }

    #[tokio::test]
    async fn relaunch_without_target_starts_the_shortcut() {
        let f = fixture();
        let path = f.root.path().join("Desktop/Cursor.lnk");
        let entry = LaunchEntry::unreadable(&path, EntryKind::Desktop);
        let command = f.env.prepare_relaunch(&entry, &[]).await.unwrap();
        let batch = std::fs::read_to_string(&command.args[0]).unwrap();
        assert!(batch.contains(&format!("start \"\" \"{}\"\r\n", path.display())));
    }

    #[test]
    fn relaunch_arguments_drop_placeholders() {
        assert_eq!(
            relaunch_arguments("--open-url -- \"%1\"", 9000),
            "--remote-debugging-port=9000 --open-url"
        );
        assert_eq!(relaunch_arguments("%*", 9000), "--remote-debugging-port=9000");
    }
}
