// ABOUTME: Session tunnel manager bridging a browser socket and an agent IO stream.
// ABOUTME: Tracks each session's lifecycle, relays frames, and guarantees one cleanup per session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::{ControlError, Result};
use crate::task::TaskMessage;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    AgentAttached,
    UserAttached,
    Relaying,
    Closed,
}

/// Frame headed to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    /// Keepalive ping for the browser socket.
    Ping,
}

/// The agent's IO stream, as seen from the relay.
#[derive(Debug)]
pub struct AgentHalf {
    pub to_agent: mpsc::Sender<Bytes>,
    pub from_agent: mpsc::Receiver<Bytes>,
}

/// The browser socket, as seen from the relay.
#[derive(Debug)]
pub struct UserHalf {
    pub to_user: mpsc::Sender<Frame>,
    pub from_user: mpsc::Receiver<Bytes>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Longest a session may sit in `Created` or `AgentAttached`.
    pub attach_timeout: Duration,
    /// Relay ends after this long without a data frame in either direction.
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_sessions: usize,
    /// Bound on each relay write.
    pub send_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            attach_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(10),
            max_sessions: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}

struct Session {
    agent_id: Option<String>,
    created_at: DateTime<Utc>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    agent: Option<AgentHalf>,
    user: Option<UserHalf>,
}

impl Session {
    fn current(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// Owns every live session. Sessions exist only in memory and die with the
/// process.
pub struct SessionManager {
    config: SessionConfig,
    dispatcher: Dispatcher,
    sessions: Mutex<HashMap<SessionId, Session>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(config: SessionConfig, dispatcher: Dispatcher) -> Arc<Self> {
        Arc::new(Self {
            config,
            dispatcher,
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // The table is only touched in short synchronous sections, so a poisoned
    // lock still holds a consistent map.
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a session in `Created` and start its attach reaper.
    pub fn create_session(self: &Arc<Self>) -> Result<SessionId> {
        let id = Uuid::new_v4().to_string();
        let (state, watcher) = watch::channel(SessionState::Created);
        let cancel = self.shutdown.child_token();

        {
            let mut sessions = self.sessions();
            // Checked under the table lock so `shutdown` cannot miss this session.
            if self.shutdown.is_cancelled() {
                return Err(ControlError::InvalidState(
                    "session manager is shutting down".to_string(),
                ));
            }
            if sessions.len() >= self.config.max_sessions {
                return Err(ControlError::ResourceExhausted(format!(
                    "session limit of {} reached",
                    self.config.max_sessions
                )));
            }
            sessions.insert(
                id.clone(),
                Session {
                    agent_id: None,
                    created_at: Utc::now(),
                    state,
                    cancel: cancel.clone(),
                    agent: None,
                    user: None,
                },
            );
        }

        let manager = Arc::clone(self);
        let reaped = id.clone();
        tokio::spawn(async move { manager.reap(reaped, watcher, cancel).await });

        debug!(session_id = %id, "Session created");
        Ok(id)
    }

    /// Ask `agent_id` to open its side of the session. A session whose agent
    /// cannot be reached is closed before the error is returned.
    pub async fn request_agent_open(&self, session_id: &str, agent_id: &str) -> Result<()> {
        {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| ControlError::not_found("session", session_id))?;
            if session.current() != SessionState::Created {
                return Err(ControlError::InvalidState(format!(
                    "session {session_id} is {:?}, cannot request an agent",
                    session.current()
                )));
            }
            session.agent_id = Some(agent_id.to_string());
        }

        let task = TaskMessage::open_session(session_id);
        if let Err(e) = self.dispatcher.dispatch_one(agent_id, &task).await {
            warn!(session_id = %session_id, agent_id = %agent_id, error = %e, "Agent could not open session");
            self.close_session(session_id);
            return Err(e);
        }
        info!(session_id = %session_id, agent_id = %agent_id, "Session open requested");
        Ok(())
    }

    /// Bind the agent's IO stream. Only valid in `Created`.
    pub fn attach_agent_side(&self, session_id: &str, half: AgentHalf) -> Result<()> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| ControlError::not_found("session", session_id))?;
        let state = session.current();
        if state != SessionState::Created {
            return Err(ControlError::InvalidState(format!(
                "session {session_id} is {state:?}, cannot attach agent"
            )));
        }
        session.agent = Some(half);
        session.state.send_replace(SessionState::AgentAttached);
        debug!(session_id = %session_id, "Agent side attached");
        Ok(())
    }

    /// Bind the browser socket. Requires the agent side first.
    pub fn attach_user_side(&self, session_id: &str, half: UserHalf) -> Result<()> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| ControlError::not_found("session", session_id))?;
        let state = session.current();
        if state != SessionState::AgentAttached || session.user.is_some() {
            return Err(ControlError::InvalidState(format!(
                "session {session_id} is {state:?}, cannot attach user"
            )));
        }
        session.user = Some(half);
        session.state.send_replace(SessionState::UserAttached);
        debug!(session_id = %session_id, "User side attached");
        Ok(())
    }

    /// Wait until the agent side has attached, for browsers that arrive first.
    pub async fn wait_for_agent(&self, session_id: &str, timeout: Duration) -> Result<()> {
        let mut watcher = self
            .sessions()
            .get(session_id)
            .map(|s| s.state.subscribe())
            .ok_or_else(|| ControlError::not_found("session", session_id))?;

        let state = match tokio::time::timeout(
            timeout,
            watcher.wait_for(|s| *s != SessionState::Created),
        )
        .await
        {
            Err(_) => {
                return Err(ControlError::InvalidState(format!(
                    "session {session_id}: agent did not attach within {timeout:?}"
                )))
            }
            Ok(Err(_)) => return Err(ControlError::not_found("session", session_id)),
            Ok(Ok(state)) => *state,
        };

        if state == SessionState::Closed {
            return Err(ControlError::InvalidState(format!(
                "session {session_id} closed before the agent attached"
            )));
        }
        Ok(())
    }

    /// Pump frames between both halves until either side closes, a write
    /// fails, the session idles out, or it is closed. The session is closed
    /// on every exit, including when this future is dropped.
    pub async fn relay(&self, session_id: &str) -> Result<()> {
        let (mut agent, mut user, cancel) = {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| ControlError::not_found("session", session_id))?;
            let state = session.current();
            if state != SessionState::UserAttached {
                return Err(ControlError::InvalidState(format!(
                    "session {session_id} is {state:?}, cannot relay"
                )));
            }
            let (Some(agent), Some(user)) = (session.agent.take(), session.user.take()) else {
                return Err(ControlError::Internal(format!(
                    "session {session_id} is missing a half"
                )));
            };
            session.state.send_replace(SessionState::Relaying);
            (agent, user, session.cancel.clone())
        };
        let _guard = CloseOnDrop {
            manager: self,
            session_id,
        };

        let idle_timeout = self.config.idle_timeout;
        let send_timeout = self.config.send_timeout;
        let interval = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + interval, interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        info!(session_id = %session_id, "Relay started");
        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break "closed",
                _ = &mut idle => break "idle timeout",
                _ = keepalive.tick() => {
                    if user.to_user.send_timeout(Frame::Ping, send_timeout).await.is_err() {
                        break "browser write failed";
                    }
                }
                frame = agent.from_agent.recv() => {
                    let Some(data) = frame else { break "agent disconnected" };
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    if user.to_user.send_timeout(Frame::Data(data), send_timeout).await.is_err() {
                        break "browser write failed";
                    }
                }
                frame = user.from_user.recv() => {
                    let Some(data) = frame else { break "browser disconnected" };
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    if agent.to_agent.send_timeout(data, send_timeout).await.is_err() {
                        break "agent write failed";
                    }
                }
            }
        };
        info!(session_id = %session_id, reason, "Relay ended");
        Ok(())
    }

    /// Tear a session down. Safe to call any number of times from any path.
    pub fn close_session(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions().remove(session_id) else {
            return false;
        };
        session.cancel.cancel();
        session.state.send_replace(SessionState::Closed);
        info!(
            session_id = %session_id,
            agent_id = session.agent_id.as_deref().unwrap_or("-"),
            lived_ms = (Utc::now() - session.created_at).num_milliseconds(),
            "Session closed"
        );
        // Dropping the record drops any halves still parked in it.
        true
    }

    /// Current state, or `None` once the session is gone.
    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions().get(session_id).map(Session::current)
    }

    pub fn subscribe(&self, session_id: &str) -> Option<watch::Receiver<SessionState>> {
        self.sessions().get(session_id).map(|s| s.state.subscribe())
    }

    pub fn agent_id(&self, session_id: &str) -> Option<String> {
        self.sessions()
            .get(session_id)
            .and_then(|s| s.agent_id.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Close every session and stop all reapers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<SessionId> = self.sessions().keys().cloned().collect();
        for id in ids {
            self.close_session(&id);
        }
    }

    async fn reap(
        &self,
        session_id: SessionId,
        mut watcher: watch::Receiver<SessionState>,
        cancel: CancellationToken,
    ) {
        loop {
            let phase = *watcher.borrow_and_update();
            if !matches!(phase, SessionState::Created | SessionState::AgentAttached) {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = watcher.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.config.attach_timeout) => {
                    warn!(session_id = %session_id, state = ?phase, "Session attach timed out");
                    self.close_session(&session_id);
                    return;
                }
            }
        }
    }
}

struct CloseOnDrop<'a> {
    manager: &'a SessionManager,
    session_id: &'a str,
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        self.manager.close_session(self.session_id);
    }
}
