// ABOUTME: Scheduler bridge: turns job definitions into timer registrations and fires.
// ABOUTME: Resolves each job's target agents and fans a Command task out through the dispatcher.

pub mod engine;

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{ControlError, Result};
use crate::registry::{Cover, JobId, JobKind, JobRegistry, ScheduledJob};
use crate::task::TaskMessage;

use self::engine::FireFn;

pub struct SchedulerBridge {
    jobs: Arc<JobRegistry>,
    dispatcher: Dispatcher,
}

impl SchedulerBridge {
    pub fn new(jobs: Arc<JobRegistry>, dispatcher: Dispatcher) -> Self {
        Self { jobs, dispatcher }
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Reject definitions that can never run as described.
    pub fn validate(job: &ScheduledJob) -> Result<()> {
        if job.kind == JobKind::Scheduled && job.cover == Cover::AlertTrigger {
            return Err(ControlError::Invalid(
                "scheduled jobs cannot target the alerting agent".to_string(),
            ));
        }
        if job.kind == JobKind::Scheduled && job.schedule.trim().is_empty() {
            return Err(ControlError::Invalid(format!(
                "job {} has no schedule",
                job.id
            )));
        }
        Ok(())
    }

    /// Add or replace a job. Scheduled jobs get a fresh timer; the registry
    /// deregisters whatever timer the previous definition held.
    pub async fn register(&self, mut job: ScheduledJob) -> Result<()> {
        Self::validate(&job)?;
        job.timer = None;

        if job.kind == JobKind::Scheduled {
            let fire = self.fire_fn(Arc::new(job.clone()));
            let handle = self.jobs.engine().add(&job.schedule, fire).await?;
            job.timer = Some(handle);
        }

        info!(job_id = job.id, name = %job.name, kind = ?job.kind, "Job registered");
        self.jobs.upsert(job).await;
        Ok(())
    }

    /// Drop a job and its timer. Unknown IDs are a no-op.
    pub async fn unregister(&self, job_id: JobId) -> bool {
        let removed = self.jobs.remove(job_id).await.is_some();
        if removed {
            info!(job_id, "Job unregistered");
        }
        removed
    }

    /// Run a job now, exactly as its timer would.
    pub async fn manual_fire(&self, job_id: JobId) -> Result<DispatchReport> {
        let job = self
            .jobs
            .get(job_id)
            .await
            .ok_or_else(|| ControlError::not_found("job", job_id.to_string()))?;
        Ok(fire_job(&self.dispatcher, &job, None).await)
    }

    /// Fire jobs on behalf of an alert raised by `agent_id`. Unknown job IDs
    /// are skipped with a warning.
    pub async fn trigger(&self, job_ids: &[JobId], agent_id: &str) -> Vec<(JobId, DispatchReport)> {
        let mut reports = Vec::with_capacity(job_ids.len());
        for &job_id in job_ids {
            let Some(job) = self.jobs.get(job_id).await else {
                warn!(job_id, agent_id = %agent_id, "Alert referenced an unknown job");
                continue;
            };
            reports.push((job_id, fire_job(&self.dispatcher, &job, Some(agent_id)).await));
        }
        reports
    }

    fn fire_fn(&self, job: Arc<ScheduledJob>) -> FireFn {
        let dispatcher = self.dispatcher.clone();
        Arc::new(move || -> BoxFuture<'static, ()> {
            let job = job.clone();
            let dispatcher = dispatcher.clone();
            Box::pin(async move {
                fire_job(&dispatcher, &job, None).await;
            })
        })
    }
}

/// Resolve targets and dispatch the job's command. Shared by timer fires,
/// manual fires and alert triggers.
async fn fire_job(
    dispatcher: &Dispatcher,
    job: &ScheduledJob,
    trigger_agent: Option<&str>,
) -> DispatchReport {
    let targets = resolve_targets(dispatcher, job, trigger_agent).await;
    let report = dispatcher
        .dispatch_many(&targets, TaskMessage::command(job.id, &job.command))
        .await;

    for failed in report.undelivered() {
        warn!(
            job_id = job.id,
            agent_id = %failed.agent_id,
            outcome = %failed.outcome,
            "Job command not delivered"
        );
    }
    info!(
        job_id = job.id,
        name = %job.name,
        targets = report.len(),
        delivered = report.delivered(),
        "Job fired"
    );
    report
}

async fn resolve_targets(
    dispatcher: &Dispatcher,
    job: &ScheduledJob,
    trigger_agent: Option<&str>,
) -> Vec<String> {
    match job.cover {
        Cover::Only => job.agents.clone(),
        Cover::AllExcept => {
            let mut ids: Vec<String> = dispatcher
                .agents()
                .ids()
                .await
                .into_iter()
                .filter(|id| !job.agents.contains(id))
                .collect();
            ids.sort();
            ids
        }
        Cover::AlertTrigger => trigger_agent.map(|id| vec![id.to_string()]).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::dispatch::DispatchOutcome;
    use crate::registry::{AgentConnection, AgentMeta, AgentRegistry};
    use crate::scheduler::engine::testing::RecordingEngine;
    use crate::stream::{OutboundTasks, TaskStream};
    use futures::StreamExt;
    use lookout_proto::{server_message, TaskKind};

    struct Fixture {
        engine: Arc<RecordingEngine>,
        agents: Arc<AgentRegistry>,
        bridge: SchedulerBridge,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(RecordingEngine::default());
        let agents = Arc::new(AgentRegistry::new());
        let jobs = Arc::new(JobRegistry::new(engine.clone()));
        let dispatcher = Dispatcher::new(agents.clone(), Duration::from_millis(100));
        Fixture {
            engine,
            agents,
            bridge: SchedulerBridge::new(jobs, dispatcher),
        }
    }

    async fn connect(agents: &AgentRegistry, id: &str) -> OutboundTasks {
        let (stream, outbound) = TaskStream::channel(8);
        agents
            .upsert(AgentConnection::new(id, "c", stream, AgentMeta::default()))
            .await;
        outbound
    }

    fn job(id: JobId, cover: Cover, agents: &[&str]) -> ScheduledJob {
        ScheduledJob {
            id,
            name: format!("job-{id}"),
            kind: JobKind::Scheduled,
            schedule: "0 */5 * * * *".to_string(),
            command: "df -h".to_string(),
            cover,
            agents: agents.iter().map(|a| a.to_string()).collect(),
            timer: None,
        }
    }

    async fn next_command(outbound: &mut OutboundTasks) -> (u64, Vec<u8>) {
        match outbound.next().await.unwrap().unwrap().payload {
            Some(server_message::Payload::Task(task)) => {
                assert_eq!(task.kind(), TaskKind::Command);
                (task.id, task.data)
            }
            other => panic!("expected task, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scheduled_job_rejects_alert_trigger_cover() {
        let f = fixture();
        let err = f
            .bridge
            .register(job(1, Cover::AlertTrigger, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Invalid(_)));
        assert!(f.engine.live().await.is_empty());
        assert!(f.bridge.jobs().get(1).await.is_none());
    }

    #[tokio::test]
    async fn test_bad_schedule_is_rejected_without_storing() {
        let f = fixture();
        let mut bad = job(1, Cover::Only, &["a1"]);
        bad.schedule = "every minute".to_string();
        let err = f.bridge.register(bad).await.unwrap_err();
        assert!(matches!(err, ControlError::Invalid(_)));
        assert!(f.bridge.jobs().ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_reregister_replaces_timer() {
        let f = fixture();
        f.bridge.register(job(1, Cover::Only, &["a1"])).await.unwrap();
        let first = f.bridge.jobs().get(1).await.unwrap().timer.unwrap();

        let mut edited = job(1, Cover::Only, &["a1"]);
        edited.schedule = "0 0 3 * * *".to_string();
        f.bridge.register(edited).await.unwrap();
        let second = f.bridge.jobs().get(1).await.unwrap().timer.unwrap();

        assert_ne!(first, second);
        assert_eq!(f.engine.removed().await, vec![first]);
        assert_eq!(f.engine.live().await, vec![second]);
        assert_eq!(
            f.engine.schedule_of(second).await.as_deref(),
            Some("0 0 3 * * *")
        );
    }

    #[tokio::test]
    async fn test_unregister_deregisters_timer() {
        let f = fixture();
        f.bridge.register(job(4, Cover::Only, &[])).await.unwrap();
        assert!(f.bridge.unregister(4).await);
        assert!(!f.bridge.unregister(4).await);
        assert!(f.engine.live().await.is_empty());
    }

    #[tokio::test]
    async fn test_triggered_job_has_no_timer() {
        let f = fixture();
        let mut triggered = job(2, Cover::AlertTrigger, &[]);
        triggered.kind = JobKind::Triggered;
        triggered.schedule.clear();
        f.bridge.register(triggered).await.unwrap();

        assert!(f.engine.live().await.is_empty());
        assert_eq!(f.bridge.jobs().get(2).await.unwrap().timer, None);
    }

    #[tokio::test]
    async fn test_timer_fire_dispatches_to_all_except_excluded() {
        let f = fixture();
        let mut a1 = connect(&f.agents, "a1").await;
        let mut a2 = connect(&f.agents, "a2").await;
        let _a3 = connect(&f.agents, "a3").await;

        f.bridge
            .register(job(9, Cover::AllExcept, &["a3"]))
            .await
            .unwrap();
        let handle = f.bridge.jobs().get(9).await.unwrap().timer.unwrap();
        f.engine.fire(handle).await;

        assert_eq!(next_command(&mut a1).await, (9, b"df -h".to_vec()));
        assert_eq!(next_command(&mut a2).await, (9, b"df -h".to_vec()));
    }

    #[tokio::test]
    async fn test_manual_fire_reports_offline_targets() {
        let f = fixture();
        let mut online = connect(&f.agents, "online").await;
        f.bridge
            .register(job(3, Cover::Only, &["online", "gone"]))
            .await
            .unwrap();

        let report = f.bridge.manual_fire(3).await.unwrap();
        assert_eq!(report.outcome("online"), Some(&DispatchOutcome::Delivered));
        assert_eq!(report.outcome("gone"), Some(&DispatchOutcome::Offline));
        assert_eq!(next_command(&mut online).await.0, 3);
    }

    #[tokio::test]
    async fn test_manual_fire_unknown_job_is_not_found() {
        let f = fixture();
        let err = f.bridge.manual_fire(404).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound { kind: "job", .. }));
    }

    #[tokio::test]
    async fn test_alert_trigger_targets_triggering_agent() {
        let f = fixture();
        let mut alerting = connect(&f.agents, "alerting").await;
        let _other = connect(&f.agents, "other").await;
        let mut triggered = job(5, Cover::AlertTrigger, &[]);
        triggered.kind = JobKind::Triggered;
        f.bridge.register(triggered).await.unwrap();

        let reports = f.bridge.trigger(&[5, 77], "alerting").await;
        assert_eq!(reports.len(), 1);
        let (job_id, report) = &reports[0];
        assert_eq!(*job_id, 5);
        assert_eq!(report.len(), 1);
        assert_eq!(next_command(&mut alerting).await.0, 5);

        // Without a triggering agent there is nobody to run on.
        let manual = f.bridge.manual_fire(5).await.unwrap();
        assert!(manual.is_empty());
    }
}
