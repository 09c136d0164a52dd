// ABOUTME: Registry of scheduled job definitions and their live timer handles.
// ABOUTME: Deregisters a superseded timer from the engine before dropping its record.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::scheduler::engine::{TimerEngine, TimerHandle};

pub type JobId = u64;

/// How a job is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fired by a cron timer (and manually).
    Scheduled,
    /// Fired only when an alert rule triggers it (and manually).
    Triggered,
}

/// Which agents a job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cover {
    /// Every connected agent except the listed ones.
    AllExcept,
    /// Only the listed agents.
    Only,
    /// The agent whose alert fired the job. Reserved for triggered jobs.
    AlertTrigger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub name: String,
    pub kind: JobKind,
    /// Six-field cron expression (seconds first). Ignored for triggered jobs.
    #[serde(default)]
    pub schedule: String,
    pub command: String,
    pub cover: Cover,
    #[serde(default)]
    pub agents: Vec<String>,
    /// Live timer registration; owned by the registry once stored.
    #[serde(skip)]
    pub timer: Option<TimerHandle>,
}

pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, ScheduledJob>>,
    engine: Arc<dyn TimerEngine>,
}

impl JobRegistry {
    pub fn new(engine: Arc<dyn TimerEngine>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            engine,
        }
    }

    /// Store `job`, deregistering the timer of the record it replaces first.
    ///
    /// The lock is held across the engine call; the engine is in-process so
    /// this never waits on the network.
    pub async fn upsert(&self, job: ScheduledJob) {
        let mut jobs = self.jobs.lock().await;
        let stale = jobs
            .get(&job.id)
            .and_then(|old| old.timer)
            .filter(|h| Some(*h) != job.timer);
        if let Some(handle) = stale {
            self.deregister(job.id, handle).await;
        }
        debug!(job_id = job.id, name = %job.name, "Job stored");
        jobs.insert(job.id, job);
    }

    pub async fn get(&self, id: JobId) -> Option<ScheduledJob> {
        self.jobs.lock().await.get(&id).cloned()
    }

    /// Remove a job, deregistering its timer. Returns the removed record.
    pub async fn remove(&self, id: JobId) -> Option<ScheduledJob> {
        let mut jobs = self.jobs.lock().await;
        let mut removed = jobs.remove(&id)?;
        if let Some(handle) = removed.timer.take() {
            self.deregister(id, handle).await;
        }
        Some(removed)
    }

    pub async fn for_each(&self, mut visit: impl FnMut(&ScheduledJob)) {
        for job in self.jobs.lock().await.values() {
            visit(job);
        }
    }

    pub async fn ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn engine(&self) -> Arc<dyn TimerEngine> {
        self.engine.clone()
    }

    async fn deregister(&self, job_id: JobId, handle: TimerHandle) {
        // An unknown handle is already gone; removal errors are only logged.
        if let Err(e) = self.engine.remove(handle).await {
            warn!(job_id, timer = %handle, error = %e, "Failed to deregister timer");
        } else {
            debug!(job_id, timer = %handle, "Timer deregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::engine::testing::RecordingEngine;

    fn job(id: JobId, timer: Option<TimerHandle>) -> ScheduledJob {
        ScheduledJob {
            id,
            name: format!("job-{id}"),
            kind: JobKind::Scheduled,
            schedule: "0 0 * * * *".to_string(),
            command: "uptime".to_string(),
            cover: Cover::Only,
            agents: vec!["a1".to_string()],
            timer,
        }
    }

    #[tokio::test]
    async fn test_replace_deregisters_old_timer() {
        let engine = Arc::new(RecordingEngine::default());
        let registry = JobRegistry::new(engine.clone());
        let first = engine.register_noop("0 0 * * * *").await;
        let second = engine.register_noop("0 0 * * * *").await;

        registry.upsert(job(1, Some(first))).await;
        registry.upsert(job(1, Some(second))).await;

        assert_eq!(engine.removed().await, vec![first]);
        assert_eq!(engine.live().await, vec![second]);
        assert_eq!(registry.get(1).await.unwrap().timer, Some(second));
    }

    #[tokio::test]
    async fn test_reupsert_same_handle_keeps_timer() {
        let engine = Arc::new(RecordingEngine::default());
        let registry = JobRegistry::new(engine.clone());
        let handle = engine.register_noop("0 0 * * * *").await;

        registry.upsert(job(1, Some(handle))).await;
        registry.upsert(job(1, Some(handle))).await;

        assert!(engine.removed().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_deregisters_and_tolerates_repeat() {
        let engine = Arc::new(RecordingEngine::default());
        let registry = JobRegistry::new(engine.clone());
        let handle = engine.register_noop("0 0 * * * *").await;
        registry.upsert(job(2, Some(handle))).await;

        let removed = registry.remove(2).await.unwrap();
        assert_eq!(removed.timer, None);
        assert!(registry.remove(2).await.is_none());
        assert_eq!(engine.removed().await, vec![handle]);
        assert!(engine.live().await.is_empty());
    }

    #[tokio::test]
    async fn test_triggered_job_without_timer() {
        let engine = Arc::new(RecordingEngine::default());
        let registry = JobRegistry::new(engine.clone());
        let mut triggered = job(3, None);
        triggered.kind = JobKind::Triggered;
        registry.upsert(triggered.clone()).await;
        registry.upsert(triggered).await;
        registry.remove(3).await;

        assert!(engine.removed().await.is_empty());
        assert!(registry.ids().await.is_empty());
    }

    #[test]
    fn test_job_definition_parses_from_json() {
        let job: ScheduledJob = serde_json::from_str(
            r#"{"id":5,"name":"backup","kind":"scheduled","schedule":"0 30 3 * * *",
                "command":"backup.sh","cover":"all_except","agents":["a2"]}"#,
        )
        .unwrap();
        assert_eq!(job.cover, Cover::AllExcept);
        assert_eq!(job.timer, None);
    }
}
