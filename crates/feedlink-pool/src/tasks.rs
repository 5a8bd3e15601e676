//! Supervised background tasks.
//!
//! Every periodic job runs through [`TaskSupervisor::spawn_periodic`]: the
//! loop waits on either cancellation or the next tick, and a tick that
//! errors or panics is logged without ending the loop. Shutdown cancels the
//! shared token and joins every handle.

use feedlink_core::error::FeedlinkError;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owner of all background tasks of one manager.
pub struct TaskSupervisor {
    token: CancellationToken,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled at shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token cancelled at shutdown or when the caller cancels it.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Unfinished tasks.
    pub fn task_count(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .count()
    }

    /// Runs `tick` every `period` until shutdown.
    ///
    /// Fails when called outside a Tokio runtime or with a zero period.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: &str,
        period: Duration,
        mut tick: F,
    ) -> Result<(), FeedlinkError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if period.is_zero() {
            return Err(FeedlinkError::TaskStart {
                task: name.to_string(),
                reason: "period must be greater than zero".to_string(),
            });
        }

        let token = self.token.clone();
        let task = name.to_string();
        self.spawn(name, async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match AssertUnwindSafe(async { tick().await }).catch_unwind().await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(task = %task, error = %e, "Periodic task failed"),
                            Err(panic) => error!(
                                task = %task,
                                panic = panic_message(&panic),
                                "Periodic task panicked"
                            ),
                        }
                    }
                }
            }
            debug!(task = %task, "Periodic task stopped");
        })
    }

    /// Spawns a one-off task. The future should watch [`Self::token`].
    pub fn spawn<Fut>(&self, name: &str, future: Fut) -> Result<(), FeedlinkError>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| FeedlinkError::TaskStart {
            task: name.to_string(),
            reason: e.to_string(),
        })?;

        let handle = runtime.spawn(future);
        let mut handles = self.handles.lock();
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((name.to_string(), handle));
        debug!(task = name, "Task spawned");
        Ok(())
    }

    /// Cancels every task and waits up to `timeout` for them to finish.
    ///
    /// Returns the number of tasks that had to be aborted.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.token.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        let deadline = tokio::time::Instant::now() + timeout;

        let mut aborted = 0;
        for (name, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => error!(task = %name, "Task panicked"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(task = %name, "Task did not stop in time, aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        info!(aborted, "Background tasks stopped");
        aborted
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let supervisor = TaskSupervisor::new();
        let err = supervisor
            .spawn_periodic("cleanup", Duration::from_secs(1), || async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, FeedlinkError::TaskStart { .. }));
    }

    #[tokio::test]
    async fn test_zero_period_rejected() {
        let supervisor = TaskSupervisor::new();
        assert!(supervisor
            .spawn_periodic("cleanup", Duration::ZERO, || async { Ok(()) })
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_survives_errors_and_panics() {
        let supervisor = TaskSupervisor::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        supervisor
            .spawn_periodic("flaky", Duration::from_secs(10), move || {
                let counter = counter.clone();
                async move {
                    match counter.fetch_add(1, Ordering::SeqCst) {
                        0 => panic!("first tick"),
                        1 => anyhow::bail!("second tick"),
                        _ => Ok(()),
                    }
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.task_count(), 1);

        assert_eq!(supervisor.shutdown(Duration::from_secs(1)).await, 0);
        assert!(!supervisor.is_running());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_stuck_task() {
        let supervisor = TaskSupervisor::new();
        supervisor
            .spawn("stuck", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .unwrap();

        assert_eq!(supervisor.shutdown(Duration::from_secs(1)).await, 1);
    }
}
