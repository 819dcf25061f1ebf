//! `shell\open\command` handlers under `HKCU\Software\Classes`.

use std::process::Command;

use tracing::debug;

use crate::entry::{apply_debug_flag, FlagEdit};
use crate::errors::BootstrapError;
use crate::host::HostApp;

/// Default-value access to registry keys. Calls block.
pub trait RegistryStore: Send + Sync {
    fn read_default(&self, key: &str) -> Result<Option<String>, BootstrapError>;

    fn write_default(&self, key: &str, value: &str) -> Result<(), BootstrapError>;
}

/// Registry access through `reg.exe`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegExe;

impl RegistryStore for RegExe {
    fn read_default(&self, key: &str) -> Result<Option<String>, BootstrapError> {
        let output = Command::new("reg")
            .args(["query", key, "/ve"])
            .output()
            .map_err(|e| BootstrapError::from_io("running reg query", e))?;
        if !output.status.success() {
            debug!(key, "registry key not present");
            return Ok(None);
        }
        Ok(parse_reg_query(&String::from_utf8_lossy(&output.stdout)))
    }

    fn write_default(&self, key: &str, value: &str) -> Result<(), BootstrapError> {
        let output = Command::new("reg")
            .args(["add", key, "/ve", "/d", value, "/f"])
            .output()
            .map_err(|e| BootstrapError::from_io("running reg add", e))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("access is denied") {
                Err(BootstrapError::PermissionDenied(format!("{key}: {}", stderr.trim())))
            } else {
                Err(BootstrapError::PlatformError(format!("reg add {key}: {}", stderr.trim())))
            }
        }
    }
}

/// Handler keys for the host's file association and URL protocol.
pub fn command_keys(host: &HostApp) -> Vec<String> {
    let slug = host.slug();
    [slug.clone(), format!("{slug}-url")]
        .iter()
        .map(|class| format!(r"HKCU\Software\Classes\{class}\shell\open\command"))
        .collect()
}

/// The `REG_SZ`/`REG_EXPAND_SZ` data of the default value in `reg query` output.
pub fn parse_reg_query(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let line = line.trim();
        ["REG_SZ", "REG_EXPAND_SZ"].iter().find_map(|kind| {
            let (_, data) = line.split_once(kind)?;
            let data = data.trim();
            (!data.is_empty()).then(|| data.to_string())
        })
    })
}

/// Split a handler command into program and arguments.
///
/// Unquoted programs may contain spaces, so they end at `.exe`.
pub fn split_handler(command: &str) -> (&str, &str) {
    let trimmed = command.trim();
    if trimmed.starts_with('"') {
        return super::super::split_program(trimmed);
    }
    match trimmed.to_ascii_lowercase().find(".exe") {
        Some(idx) => {
            let (program, rest) = trimmed.split_at(idx + 4);
            (program, rest.trim_start())
        }
        None => super::super::split_program(trimmed),
    }
}

/// Insert the flag directly after the program, keeping `%1` and all other
/// arguments.
pub fn patch_registry_command(command: &str, port: u16) -> FlagEdit {
    let (program, args) = split_handler(command);
    match apply_debug_flag(args, port) {
        FlagEdit::Unchanged => FlagEdit::Unchanged,
        FlagEdit::Replaced(args) => FlagEdit::Replaced(format!("{program} {args}")),
        FlagEdit::Prepended(args) => FlagEdit::Prepended(format!("{program} {args}")),
    }
}
