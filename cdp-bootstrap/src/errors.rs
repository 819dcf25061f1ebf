use std::fmt::Display;
use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Launch entry unreadable: {0}")]
    EntryUnreadable(String),

    #[error("Platform-specific error: {0}")]
    PlatformError(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BootstrapError {
    /// Wrap an I/O failure with the operation it belongs to, keeping permission
    /// problems distinguishable from everything else.
    pub fn from_io(context: impl Display, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => {
                BootstrapError::PermissionDenied(format!("{context}: {err}"))
            }
            _ => BootstrapError::Io(io::Error::new(err.kind(), format!("{context}: {err}"))),
        }
    }
}
