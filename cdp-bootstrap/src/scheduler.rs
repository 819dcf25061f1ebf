//! Cancellable periodic and one-shot tasks.
//!
//! Both handles cancel their task when dropped, so replacing a handle in a
//! struct field is enough to stop the old timer.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs a closure every `interval`, first after one full interval.
#[derive(Debug)]
pub struct PeriodicTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.child_token();
        let period = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => {
                        debug!(task = name, "periodic task cancelled");
                        break;
                    }
                    _ = ticker.tick() => tick().await,
                }
            }
        });
        Self { token, handle }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Runs a future once after `delay` unless cancelled first.
#[derive(Debug)]
pub struct DelayedTask {
    /// `None` once detached
    token: Option<CancellationToken>,
    handle: JoinHandle<()>,
}

impl DelayedTask {
    pub fn spawn<Fut>(name: &'static str, delay: Duration, task: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.child_token();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => debug!(task = name, "delayed task cancelled"),
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
        Self {
            token: Some(token),
            handle,
        }
    }

    pub fn cancel(&self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Keep the task running after the handle goes away.
    pub fn detach(mut self) {
        self.token = None;
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
