// ABOUTME: Timer engine seam between the scheduler bridge and tokio-cron-scheduler.
// ABOUTME: CronEngine registers async cron jobs; handles are the scheduler's job UUIDs.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use uuid::Uuid;

use crate::error::{ControlError, Result};

/// Handle of a live timer registration.
pub type TimerHandle = Uuid;

/// Callback run on every timer fire.
pub type FireFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A cron-style timer engine.
#[async_trait]
pub trait TimerEngine: Send + Sync {
    /// Register `fire` to run on `schedule`. Invalid schedules are rejected
    /// with [`ControlError::Invalid`].
    async fn add(&self, schedule: &str, fire: FireFn) -> Result<TimerHandle>;

    /// Remove a registration. Removing an unknown handle is not an error.
    async fn remove(&self, handle: TimerHandle) -> Result<()>;
}

/// [`TimerEngine`] backed by a running `tokio-cron-scheduler` instance.
pub struct CronEngine {
    scheduler: JobScheduler,
}

impl CronEngine {
    pub async fn start() -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        scheduler.start().await?;
        info!("Cron engine started");
        Ok(Self { scheduler })
    }

    pub async fn shutdown(&self) {
        let mut scheduler = self.scheduler.clone();
        if let Err(e) = scheduler.shutdown().await {
            tracing::warn!(error = ?e, "Cron engine shutdown failed");
        }
    }
}

#[async_trait]
impl TimerEngine for CronEngine {
    async fn add(&self, schedule: &str, fire: FireFn) -> Result<TimerHandle> {
        let job = Job::new_async(schedule, move |_uuid, _l| {
            let fire = fire.clone();
            Box::pin(async move {
                fire().await;
            })
        })
        .map_err(|e| ControlError::Invalid(format!("invalid schedule {schedule:?}: {e:?}")))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| ControlError::Internal(format!("registering timer: {e:?}")))
    }

    async fn remove(&self, handle: TimerHandle) -> Result<()> {
        self.scheduler
            .remove(&handle)
            .await
            .map_err(|e| ControlError::Internal(format!("removing timer {handle}: {e:?}")))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cron_engine_rejects_bad_schedule() {
        let engine = CronEngine::start().await.unwrap();
        let noop: FireFn = Arc::new(|| -> BoxFuture<'static, ()> { Box::pin(async {}) });
        let err = engine.add("not a schedule", noop).await.unwrap_err();
        assert!(matches!(err, ControlError::Invalid(_)));
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cron_engine_add_and_remove() {
        let engine = CronEngine::start().await.unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let fire: FireFn = Arc::new(move || -> BoxFuture<'static, ()> {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        let handle = engine.add("0 0 0 1 1 *", fire).await.unwrap();
        engine.remove(handle).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        engine.shutdown().await;
    }
}
