//! `.lnk` access through the shell-link COM object.

use std::path::Path;

use crate::errors::BootstrapError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellLinkInfo {
    pub target: String,
    pub arguments: String,
}

/// Read and rewrite shortcut files. Calls block; run them off the runtime.
pub trait ShellLinkStore: Send + Sync {
    fn read(&self, path: &Path) -> Result<ShellLinkInfo, BootstrapError>;

    fn write_arguments(&self, path: &Path, arguments: &str) -> Result<(), BootstrapError>;
}

/// The system shell-link implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ComShellLinks;

#[cfg(target_os = "windows")]
mod com {
    use std::path::Path;

    use tracing::debug;
    use windows::core::{Interface, HRESULT, HSTRING, PCWSTR};
    use windows::Win32::Foundation::{MAX_PATH, TRUE};
    use windows::Win32::Storage::FileSystem::WIN32_FIND_DATAW;
    use windows::Win32::System::Com::{
        CoCreateInstance, CoInitializeEx, IPersistFile, CLSCTX_INPROC_SERVER,
        COINIT_MULTITHREADED, STGM_READ, STGM_READWRITE,
    };
    use windows::Win32::UI::Shell::{IShellLinkW, ShellLink};

    use super::ShellLinkInfo;
    use crate::errors::BootstrapError;

    const RPC_E_CHANGED_MODE: HRESULT = HRESULT(0x80010106u32 as i32);

    fn init_com() -> Result<(), BootstrapError> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr.is_err() && hr != RPC_E_CHANGED_MODE {
            return Err(BootstrapError::PlatformError(format!(
                "Failed to initialize COM: {hr}"
            )));
        }
        if hr == RPC_E_CHANGED_MODE {
            debug!("COM already initialized in this thread");
        }
        Ok(())
    }

    fn open(path: &Path, mode: windows::Win32::System::Com::STGM) -> Result<(IShellLinkW, IPersistFile), BootstrapError> {
        init_com()?;
        unsafe {
            let link: IShellLinkW = CoCreateInstance(&ShellLink, None, CLSCTX_INPROC_SERVER)
                .map_err(|e| {
                    BootstrapError::PlatformError(format!("Failed to create ShellLink: {e}"))
                })?;
            let file: IPersistFile = link
                .cast()
                .map_err(|e| BootstrapError::PlatformError(format!("IPersistFile: {e}")))?;
            file.Load(&HSTRING::from(path), mode)
                .map_err(|e| {
                    BootstrapError::EntryUnreadable(format!("{}: {e}", path.display()))
                })?;
            Ok((link, file))
        }
    }

    fn wide_to_string(buf: &[u16]) -> String {
        let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        String::from_utf16_lossy(&buf[..len])
    }

    pub(super) fn read(path: &Path) -> Result<ShellLinkInfo, BootstrapError> {
        let (link, _file) = open(path, STGM_READ)?;
        let mut target = vec![0u16; MAX_PATH as usize];
        let mut arguments = vec![0u16; 4096];
        unsafe {
            let mut find_data = WIN32_FIND_DATAW::default();
            link.GetPath(&mut target, &mut find_data, 0)
                .map_err(|e| BootstrapError::EntryUnreadable(format!("target: {e}")))?;
            link.GetArguments(&mut arguments)
                .map_err(|e| BootstrapError::EntryUnreadable(format!("arguments: {e}")))?;
        }
        Ok(ShellLinkInfo {
            target: wide_to_string(&target),
            arguments: wide_to_string(&arguments),
        })
    }

    pub(super) fn write_arguments(path: &Path, arguments: &str) -> Result<(), BootstrapError> {
        let (link, file) = open(path, STGM_READWRITE)?;
        unsafe {
            link.SetArguments(&HSTRING::from(arguments))
                .map_err(|e| BootstrapError::PlatformError(format!("SetArguments: {e}")))?;
            file.Save(PCWSTR::null(), TRUE).map_err(|e| {
                BootstrapError::PermissionDenied(format!("saving {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }
}

#[cfg(target_os = "windows")]
impl ShellLinkStore for ComShellLinks {
    fn read(&self, path: &Path) -> Result<ShellLinkInfo, BootstrapError> {
        com::read(path)
    }

    fn write_arguments(&self, path: &Path, arguments: &str) -> Result<(), BootstrapError> {
        com::write_arguments(path, arguments)
    }
}

#[cfg(not(target_os = "windows"))]
impl ShellLinkStore for ComShellLinks {
    fn read(&self, path: &Path) -> Result<ShellLinkInfo, BootstrapError> {
        Err(BootstrapError::UnsupportedPlatform(format!(
            "cannot read shell link {} on this OS",
            path.display()
        )))
    }

    fn write_arguments(&self, path: &Path, _arguments: &str) -> Result<(), BootstrapError> {
        Err(BootstrapError::UnsupportedPlatform(format!(
            "cannot write shell link {} on this OS",
            path.display()
        )))
    }
}
