//! Periodic background sweep of expired sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::SessionHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScavengerState {
    Stopped,
    Running,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs [`SessionHandler::scavenge`] on a fixed interval.
///
/// Passes never overlap: the next tick is only awaited after the current
/// pass finishes. Stopping waits for an in-flight pass, so no eviction
/// happens after [`stop`](Self::stop) returns.
pub struct Scavenger {
    handler: Arc<SessionHandler>,
    running: Option<Running>,
}

impl Scavenger {
    pub fn new(handler: Arc<SessionHandler>) -> Self {
        Self {
            handler,
            running: None,
        }
    }

    pub fn state(&self) -> ScavengerState {
        match self.running {
            Some(_) => ScavengerState::Running,
            None => ScavengerState::Stopped,
        }
    }

    /// Spawn the sweep task. Does nothing if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, interval: Duration) {
        if self.running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handler = Arc::clone(&self.handler);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        handler.scavenge().await;
                    }
                }
            }
            debug!("Session scavenger loop exited");
        });

        info!(interval_secs = interval.as_secs_f64(), "Session scavenger started");
        self.running = Some(Running { cancel, task });
    }

    /// Stop the sweep task, waiting for any pass in progress.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!(error = %e, "Session scavenger task failed");
        }
        info!("Session scavenger stopped");
    }
}

impl Drop for Scavenger {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionManagerConfig;
    use crate::store::LocalStore;

    fn handler() -> Arc<SessionHandler> {
        Arc::new(SessionHandler::new(
            &SessionManagerConfig::new(),
            Arc::new(LocalStore),
        ))
    }

    #[tokio::test]
    async fn test_start_stop() {
        let mut scavenger = Scavenger::new(handler());
        assert_eq!(scavenger.state(), ScavengerState::Stopped);

        scavenger.start(Duration::from_millis(10));
        assert_eq!(scavenger.state(), ScavengerState::Running);
        // Second start is a no-op
        scavenger.start(Duration::from_millis(10));

        scavenger.stop().await;
        assert_eq!(scavenger.state(), ScavengerState::Stopped);
        scavenger.stop().await;
    }

    #[tokio::test]
    async fn test_evicts_expired_sessions() {
        let handler = handler();
        handler.set_default_max_idle_secs(1);
        let entry = handler.get_session(None, true).await.unwrap().unwrap();
        handler.complete(&entry).await.unwrap();

        let mut scavenger = Scavenger::new(Arc::clone(&handler));
        scavenger.start(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(1_400)).await;
        scavenger.stop().await;

        assert!(!handler.cache().contains(entry.id()));
        assert_eq!(handler.stats().sessions_expired, 1);
    }

    #[tokio::test]
    async fn test_no_eviction_after_stop() {
        let handler = handler();
        handler.set_default_max_idle_secs(1);
        let entry = handler.get_session(None, true).await.unwrap().unwrap();
        handler.complete(&entry).await.unwrap();

        let mut scavenger = Scavenger::new(Arc::clone(&handler));
        scavenger.start(Duration::from_millis(50));
        scavenger.stop().await;

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(handler.cache().contains(entry.id()));
        assert_eq!(handler.stats().sessions_expired, 0);
    }
}
