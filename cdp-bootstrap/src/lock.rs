//! Heartbeat-based election of the one instance that polls the driver.
//!
//! The lock lives in the shared store under `<host slug>-instance-lock` as a
//! single JSON value, so owner and heartbeat are always written together.
//! Two instances may briefly both believe they own it; that costs one
//! duplicate poll and is tolerated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::host::HostApp;
use crate::store::KeyValueStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceLock {
    pub owner_id: String,
    pub heartbeat_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRole {
    Owner,
    Standby { owner_id: String },
}

/// Result of one arbiter evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTick {
    pub role: LockRole,
    /// The lock was free, stale or held by someone else and is now ours.
    pub claimed: bool,
    /// First standby tick after being owner (or at start); show the indicator once.
    pub entered_standby: bool,
    /// First owner tick after a standby period.
    pub resumed: bool,
}

impl LockTick {
    pub fn is_owner(&self) -> bool {
        self.role == LockRole::Owner
    }
}

pub struct InstanceLockArbiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    lock_key: String,
    stale_after_ms: u64,
    standby: AtomicBool,
}

impl InstanceLockArbiter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        host: &HostApp,
        stale_after_ms: u64,
    ) -> Self {
        Self::with_instance_id(store, clock, host, stale_after_ms, Uuid::new_v4().to_string())
    }

    pub fn with_instance_id(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        host: &HostApp,
        stale_after_ms: u64,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            instance_id: instance_id.into(),
            lock_key: format!("{}-instance-lock", host.slug()),
            stale_after_ms,
            standby: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn is_standby(&self) -> bool {
        self.standby.load(Ordering::SeqCst)
    }

    pub async fn read(&self) -> Option<InstanceLock> {
        self.store
            .get_or::<Option<InstanceLock>>(&self.lock_key, None)
            .await
    }

    /// Evaluate the lock once: claim, refresh, or stand by.
    pub async fn tick(&self) -> LockTick {
        let now = self.clock.now_ms();
        let current = self.read().await;

        if let Some(lock) = &current {
            let held_by_other = lock.owner_id != self.instance_id;
            let fresh = now.saturating_sub(lock.heartbeat_ms) < self.stale_after_ms;
            if held_by_other && fresh {
                let was_standby = self.standby.swap(true, Ordering::SeqCst);
                if !was_standby {
                    info!(
                        owner = %lock.owner_id,
                        "instance lock held by another instance, entering standby"
                    );
                }
                return LockTick {
                    role: LockRole::Standby {
                        owner_id: lock.owner_id.clone(),
                    },
                    claimed: false,
                    entered_standby: !was_standby,
                    resumed: false,
                };
            }
        }

        let claimed = current
            .as_ref()
            .map(|lock| lock.owner_id != self.instance_id)
            .unwrap_or(true);
        let lock = InstanceLock {
            owner_id: self.instance_id.clone(),
            heartbeat_ms: now,
        };
        if let Err(e) = self.store.set(&self.lock_key, &lock).await {
            warn!(key = %self.lock_key, "failed to write instance lock: {}", e);
        }

        let was_standby = self.standby.swap(false, Ordering::SeqCst);
        if claimed {
            info!(instance = %self.instance_id, "instance lock acquired");
        } else {
            debug!(instance = %self.instance_id, "instance lock heartbeat refreshed");
        }
        LockTick {
            role: LockRole::Owner,
            claimed,
            entered_standby: false,
            resumed: was_standby,
        }
    }
}
