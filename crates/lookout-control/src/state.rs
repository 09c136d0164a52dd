// ABOUTME: Shared control-plane state handed to the gRPC service and HTTP handlers.
// ABOUTME: Wires registries, dispatcher, session manager and scheduler bridge together.

use std::sync::Arc;

use lookout_proto::TaskResult;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::registry::{AgentRegistry, ApiToken, JobRegistry, TokenRegistry};
use crate::scheduler::engine::TimerEngine;
use crate::scheduler::SchedulerBridge;
use crate::session::SessionManager;

const RESULT_CHANNEL_CAPACITY: usize = 256;

/// A task outcome reported by an agent.
#[derive(Debug, Clone)]
pub struct AgentTaskResult {
    pub agent_id: String,
    pub result: TaskResult,
}

pub struct ControlState {
    pub agents: Arc<AgentRegistry>,
    pub tokens: Arc<TokenRegistry>,
    pub jobs: Arc<JobRegistry>,
    pub dispatcher: Dispatcher,
    pub sessions: Arc<SessionManager>,
    pub scheduler: SchedulerBridge,
    /// Identifies this dashboard in `Welcome` messages.
    pub server_id: String,
    /// Outbound buffer per agent stream.
    pub channel_buffer: usize,
    results: broadcast::Sender<AgentTaskResult>,
}

impl ControlState {
    pub fn new(config: &Config, engine: Arc<dyn TimerEngine>) -> Arc<Self> {
        let agents = Arc::new(AgentRegistry::new());
        let jobs = Arc::new(JobRegistry::new(engine));
        let dispatcher = Dispatcher::new(agents.clone(), config.send_timeout());
        let sessions = SessionManager::new(config.session_config(), dispatcher.clone());
        let scheduler = SchedulerBridge::new(jobs.clone(), dispatcher.clone());
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);

        Arc::new(Self {
            agents,
            tokens: Arc::new(TokenRegistry::new()),
            jobs,
            dispatcher,
            sessions,
            scheduler,
            server_id: format!("lookout-{}", env!("CARGO_PKG_VERSION")),
            channel_buffer: config.dispatch.channel_buffer,
            results,
        })
    }

    /// Seed the configured bootstrap token, if any.
    pub async fn seed_bootstrap_token(&self, config: &Config) {
        if let Some(token) = &config.auth.bootstrap_token {
            self.tokens
                .upsert(ApiToken {
                    token: token.clone(),
                    user_id: config.auth.bootstrap_user,
                    note: "bootstrap".to_string(),
                })
                .await;
            debug!(user_id = config.auth.bootstrap_user, "Bootstrap token seeded");
        }
    }

    /// Observe task results as agents report them.
    pub fn subscribe_results(&self) -> broadcast::Receiver<AgentTaskResult> {
        self.results.subscribe()
    }

    pub(crate) fn publish_result(&self, agent_id: &str, result: TaskResult) {
        // No subscribers is normal.
        let _ = self.results.send(AgentTaskResult {
            agent_id: agent_id.to_string(),
            result,
        });
    }
}
