// ABOUTME: Task dispatch: delivers a TaskMessage to one or many agent streams.
// ABOUTME: Fan-out is concurrent and reports offline / failed / delivered per target.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lookout_proto::ServerMessage;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ControlError, Result};
use crate::registry::AgentRegistry;
use crate::task::TaskMessage;

/// Result of delivering one task to one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Delivered,
    /// No live stream registered for the agent.
    Offline,
    /// The stream exists but refused the write.
    Failed(String),
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Delivered => write!(f, "delivered"),
            DispatchOutcome::Offline => write!(f, "offline"),
            DispatchOutcome::Failed(reason) => write!(f, "delivery failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetResult {
    pub agent_id: String,
    pub outcome: DispatchOutcome,
}

/// Per-target results of a fan-out, in the order targets were given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub results: Vec<TargetResult>,
}

impl DispatchReport {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn delivered(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == DispatchOutcome::Delivered)
            .count()
    }

    pub fn undelivered(&self) -> impl Iterator<Item = &TargetResult> {
        self.results
            .iter()
            .filter(|r| r.outcome != DispatchOutcome::Delivered)
    }

    pub fn outcome(&self, agent_id: &str) -> Option<&DispatchOutcome> {
        self.results
            .iter()
            .find(|r| r.agent_id == agent_id)
            .map(|r| &r.outcome)
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.results {
            writeln!(f, "{}: {}", r.agent_id, r.outcome)?;
        }
        Ok(())
    }
}

/// Sends tasks down registered agent streams. Holds no state of its own.
#[derive(Clone)]
pub struct Dispatcher {
    agents: Arc<AgentRegistry>,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(agents: Arc<AgentRegistry>, send_timeout: Duration) -> Self {
        Self {
            agents,
            send_timeout,
        }
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Deliver to a single agent. Best effort, never retried.
    pub async fn dispatch_one(&self, agent_id: &str, task: &TaskMessage) -> Result<()> {
        match self.deliver(agent_id, task.to_server_message()).await {
            DispatchOutcome::Delivered => Ok(()),
            DispatchOutcome::Offline => Err(ControlError::unreachable(agent_id, "offline")),
            DispatchOutcome::Failed(reason) => Err(ControlError::unreachable(
                agent_id,
                format!("delivery failed: {reason}"),
            )),
        }
    }

    /// Deliver to every listed agent independently.
    pub async fn dispatch_many(&self, agent_ids: &[String], task: TaskMessage) -> DispatchReport {
        let msg = task.to_server_message();
        let outcomes = join_all(
            agent_ids
                .iter()
                .map(|agent_id| self.deliver(agent_id, msg.clone())),
        )
        .await;

        let report = DispatchReport {
            results: agent_ids
                .iter()
                .cloned()
                .zip(outcomes)
                .map(|(agent_id, outcome)| TargetResult { agent_id, outcome })
                .collect(),
        };
        debug!(
            kind = task.kind.as_str_name(),
            targets = report.len(),
            delivered = report.delivered(),
            "Task fan-out finished"
        );
        report
    }

    /// Deliver to every agent currently registered.
    pub async fn dispatch_all(&self, task: TaskMessage) -> DispatchReport {
        let ids = self.agents.ids().await;
        self.dispatch_many(&ids, task).await
    }

    async fn deliver(&self, agent_id: &str, msg: ServerMessage) -> DispatchOutcome {
        // Clone the handle and drop the registry lock before writing.
        let Some(stream) = self.agents.stream(agent_id).await else {
            return DispatchOutcome::Offline;
        };
        match stream.send(msg, self.send_timeout).await {
            Ok(()) => DispatchOutcome::Delivered,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Task delivery failed");
                DispatchOutcome::Failed(e.to_string())
            }
        }
    }
}
