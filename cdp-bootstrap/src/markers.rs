//! Bootstrap markers persisted across restarts.
//!
//! Each marker is its own key and every update is a single key write, so a
//! concurrent instance can interleave but never corrupt another marker.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::BootstrapError;
use crate::store::KeyValueStore;

pub mod keys {
    pub const REGISTRY_CONFIGURED: &str = "cdp-registry-configured";
    pub const SKIP_PROMPT: &str = "cdp-skip-prompt";
    pub const LAST_AUTO_RELAUNCH: &str = "cdp-last-auto-relaunch";
    pub const CONNECTION_ESTABLISHED: &str = "cdp-connection-established";
    pub const ENABLED: &str = "enabled-global";
    pub const BACKGROUND_MODE: &str = "background-mode";
    pub const BACKGROUND_DONT_SHOW: &str = "background-dont-show";
    pub const POLL_INTERVAL: &str = "poll-interval";
    pub const BLOCKED_PATTERNS: &str = "blocked-patterns";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapMarkers {
    pub registry_configured: bool,
    pub skip_prompt_requested: bool,
    /// Epoch ms of the last automatic relaunch attempt, 0 if never
    pub last_auto_relaunch_ms: u64,
    pub connection_ever_established: bool,
}

impl BootstrapMarkers {
    /// True once `cooldown_ms` has passed since the last automatic relaunch.
    ///
    /// A timestamp in the future (clock skew, another instance) counts as
    /// "just happened".
    pub fn cooldown_elapsed(&self, now_ms: u64, cooldown_ms: u64) -> bool {
        if self.last_auto_relaunch_ms == 0 {
            return true;
        }
        now_ms.saturating_sub(self.last_auto_relaunch_ms) >= cooldown_ms
            && now_ms >= self.last_auto_relaunch_ms
    }
}

/// Typed access to the markers in a shared store.
#[derive(Clone)]
pub struct Markers {
    store: Arc<dyn KeyValueStore>,
}

impl Markers {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> BootstrapMarkers {
        let markers = BootstrapMarkers {
            registry_configured: self.store.get_or(keys::REGISTRY_CONFIGURED, false).await,
            skip_prompt_requested: self.store.get_or(keys::SKIP_PROMPT, false).await,
            last_auto_relaunch_ms: self.store.get_or(keys::LAST_AUTO_RELAUNCH, 0u64).await,
            connection_ever_established: self
                .store
                .get_or(keys::CONNECTION_ESTABLISHED, false)
                .await,
        };
        debug!(?markers, "loaded bootstrap markers");
        markers
    }

    pub async fn set_registry_configured(&self, value: bool) -> Result<(), BootstrapError> {
        self.store.set(keys::REGISTRY_CONFIGURED, &value).await
    }

    pub async fn set_skip_prompt(&self, value: bool) -> Result<(), BootstrapError> {
        self.store.set(keys::SKIP_PROMPT, &value).await
    }

    pub async fn stamp_auto_relaunch(&self, now_ms: u64) -> Result<(), BootstrapError> {
        self.store.set(keys::LAST_AUTO_RELAUNCH, &now_ms).await
    }

    pub async fn set_connection_established(&self, value: bool) -> Result<(), BootstrapError> {
        self.store.set(keys::CONNECTION_ESTABLISHED, &value).await
    }

    /// Best-effort write used where a failed marker must not stop the pass.
    pub async fn try_set_registry_configured(&self) {
        if let Err(e) = self.set_registry_configured(true).await {
            warn!("failed to persist registry-configured marker: {}", e);
        }
    }
}
