// ABOUTME: Registry of live agent connections keyed by agent ID.
// ABOUTME: Owns each agent's command stream and closes it on replace or removal.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lookout_proto::HostInfo;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::stream::TaskStream;

/// Static metadata reported at registration.
#[derive(Debug, Clone, Default)]
pub struct AgentMeta {
    pub name: String,
    pub tags: Vec<String>,
    pub host: Option<HostInfo>,
}

/// A registered agent and the stream it is reachable on.
#[derive(Debug)]
pub struct AgentConnection {
    pub agent_id: String,
    /// Distinguishes successive streams of the same agent.
    pub connection_id: String,
    pub meta: AgentMeta,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    stream: TaskStream,
}

impl AgentConnection {
    pub fn new(
        agent_id: impl Into<String>,
        connection_id: impl Into<String>,
        stream: TaskStream,
        meta: AgentMeta,
    ) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            connection_id: connection_id.into(),
            meta,
            connected_at: now,
            last_seen: now,
            stream,
        }
    }

    fn summary(&self) -> AgentSummary {
        let host = self.meta.host.as_ref();
        AgentSummary {
            agent_id: self.agent_id.clone(),
            connection_id: self.connection_id.clone(),
            name: self.meta.name.clone(),
            tags: self.meta.tags.clone(),
            platform: host.map(|h| h.platform.clone()).unwrap_or_default(),
            arch: host.map(|h| h.arch.clone()).unwrap_or_default(),
            agent_version: host.map(|h| h.agent_version.clone()).unwrap_or_default(),
            connected_at: self.connected_at,
            last_seen: self.last_seen,
        }
    }
}

/// Copy of an agent entry safe to hand out of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub connection_id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub platform: String,
    pub arch: String,
    pub agent_version: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Connected agents by ID. At most one live stream per ID.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentConnection>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `conn.agent_id`. A previous stream is
    /// closed before the new entry becomes visible. Returns the replaced
    /// connection ID, if any.
    pub async fn upsert(&self, conn: AgentConnection) -> Option<String> {
        let mut agents = self.agents.write().await;
        let replaced = agents.remove(&conn.agent_id).map(|old| {
            old.stream.close();
            debug!(
                agent_id = %old.agent_id,
                connection_id = %old.connection_id,
                "Closed superseded agent stream"
            );
            old.connection_id
        });
        agents.insert(conn.agent_id.clone(), conn);
        replaced
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentSummary> {
        self.agents.read().await.get(agent_id).map(|a| a.summary())
    }

    /// Clone the stream handle so the caller can write after the lock is released.
    pub async fn stream(&self, agent_id: &str) -> Option<TaskStream> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|a| a.stream.clone())
    }

    /// Evict an agent, closing its stream.
    pub async fn remove(&self, agent_id: &str) -> bool {
        let removed = self.agents.write().await.remove(agent_id);
        match removed {
            Some(conn) => {
                conn.stream.close();
                true
            }
            None => false,
        }
    }

    /// Remove the entry only if it still belongs to `connection_id`. Used by
    /// a stream's reader task on exit so a reconnect is never evicted by the
    /// connection it replaced.
    pub async fn remove_connection(&self, agent_id: &str, connection_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        let owned = agents
            .get(agent_id)
            .is_some_and(|a| a.connection_id == connection_id);
        if !owned {
            return false;
        }
        if let Some(conn) = agents.remove(agent_id) {
            conn.stream.close();
        }
        true
    }

    /// Evict every agent, closing all streams. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut agents = self.agents.write().await;
        for conn in agents.values() {
            conn.stream.close();
        }
        let count = agents.len();
        agents.clear();
        count
    }

    /// Refresh `last_seen` (and host info when given) for the current connection.
    pub async fn touch(
        &self,
        agent_id: &str,
        connection_id: &str,
        host: Option<HostInfo>,
    ) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(conn) if conn.connection_id == connection_id => {
                conn.last_seen = Utc::now();
                if host.is_some() {
                    conn.meta.host = host;
                }
                true
            }
            _ => false,
        }
    }

    /// Visit every entry under the read lock. The visitor must not block.
    pub async fn for_each(&self, mut visit: impl FnMut(&AgentConnection)) {
        for conn in self.agents.read().await.values() {
            visit(conn);
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        self.agents.read().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> = self
            .agents
            .read()
            .await
            .values()
            .map(|a| a.summary())
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}
