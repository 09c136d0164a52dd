// ABOUTME: Lookout gRPC service implementation for agent connections
// ABOUTME: Handles registration, heartbeats, task results and the session IO stream

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use lookout_proto::server::Lookout;
use lookout_proto::{
    agent_message, server_message, AgentMessage, IoFrame, Register, ServerMessage, TaskKind,
    Welcome,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{AgentConnection, AgentMeta};
use crate::session::AgentHalf;
use crate::state::ControlState;
use crate::stream::{OutboundTasks, TaskStream};

/// Buffer for each direction of a session IO stream.
const IO_BUFFER: usize = 64;

/// Lookout service implementation
pub struct LookoutService {
    state: Arc<ControlState>,
}

impl LookoutService {
    pub fn new(state: Arc<ControlState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<ControlState> {
        self.state.clone()
    }
}

/// Apply one post-registration message from an agent.
async fn handle_agent_message(
    state: &ControlState,
    agent_id: &str,
    connection_id: &str,
    payload: agent_message::Payload,
) {
    match payload {
        agent_message::Payload::Heartbeat(_) => {
            debug!(agent_id = %agent_id, "Heartbeat received");
            state.agents.touch(agent_id, connection_id, None).await;
        }
        agent_message::Payload::HostReport(report) => {
            debug!(agent_id = %agent_id, "Host report received");
            state.agents.touch(agent_id, connection_id, report.host).await;
        }
        agent_message::Payload::TaskResult(result) => {
            state.agents.touch(agent_id, connection_id, None).await;
            // A failed open carries the session ID it could not serve.
            if result.kind() == TaskKind::OpenSession
                && !result.successful
                && state.sessions.close_session(result.data.trim())
            {
                warn!(agent_id = %agent_id, session_id = %result.data.trim(), "Agent refused session");
            }
            debug!(
                agent_id = %agent_id,
                task_id = result.task_id,
                kind = result.kind().as_str_name(),
                successful = result.successful,
                "Task result received"
            );
            state.publish_result(agent_id, result);
        }
        agent_message::Payload::Register(_) => {
            warn!(agent_id = %agent_id, "Ignoring repeated registration");
        }
    }
}

/// Read the opening `Register` message, giving up after `timeout`.
async fn await_registration<S>(inbound: &mut S, timeout: Duration) -> Result<Register, Status>
where
    S: Stream<Item = Result<AgentMessage, Status>> + Unpin,
{
    let first_msg = tokio::time::timeout(timeout, inbound.next())
        .await
        .map_err(|_| Status::deadline_exceeded("no registration message in time"))?
        .ok_or_else(|| Status::invalid_argument("no registration message"))?
        .map_err(|e| Status::internal(format!("stream error: {}", e)))?;

    match first_msg.payload {
        Some(agent_message::Payload::Register(r)) => Ok(r),
        _ => Err(Status::invalid_argument(
            "first message must be registration",
        )),
    }
}

#[tonic::async_trait]
impl Lookout for LookoutService {
    type AgentStreamStream = OutboundTasks;
    type IoStreamStream = Pin<Box<dyn Stream<Item = Result<IoFrame, Status>> + Send>>;

    async fn agent_stream(
        &self,
        request: Request<Streaming<AgentMessage>>,
    ) -> Result<Response<Self::AgentStreamStream>, Status> {
        let mut inbound = request.into_inner();
        let register =
            await_registration(&mut inbound, self.state.sessions.config().attach_timeout).await?;

        let agent_id = if register.agent_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            register.agent_id.clone()
        };
        let name = if register.name.is_empty() {
            agent_id.clone()
        } else {
            register.name.clone()
        };
        let connection_id = Uuid::new_v4().to_string();

        let (stream, outbound) = TaskStream::channel(self.state.channel_buffer);

        // Welcome goes first so it precedes any task dispatched after upsert.
        let welcome = ServerMessage {
            payload: Some(server_message::Payload::Welcome(Welcome {
                server_id: self.state.server_id.clone(),
                agent_id: agent_id.clone(),
                connection_id: connection_id.clone(),
            })),
        };
        stream
            .send(welcome, self.state.dispatcher.send_timeout())
            .await
            .map_err(|_| Status::internal("failed to send welcome"))?;

        let meta = AgentMeta {
            name: name.clone(),
            tags: register.tags,
            host: register.host,
        };
        let replaced = self
            .state
            .agents
            .upsert(AgentConnection::new(
                &agent_id,
                &connection_id,
                stream.clone(),
                meta,
            ))
            .await;
        match replaced {
            Some(previous) => info!(
                agent_id = %agent_id,
                name = %name,
                replaced = %previous,
                "Agent reconnected"
            ),
            None => info!(agent_id = %agent_id, name = %name, "Agent registered"),
        }

        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = stream.closed() => {
                        debug!(agent_id = %agent_id, "Stream closed by registry");
                        break;
                    }
                    next = inbound.next() => next,
                };
                match next {
                    Some(Ok(msg)) => {
                        if let Some(payload) = msg.payload {
                            handle_agent_message(&state, &agent_id, &connection_id, payload).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(agent_id = %agent_id, error = %e, "Stream error");
                        break;
                    }
                    None => break,
                }
            }

            if state
                .agents
                .remove_connection(&agent_id, &connection_id)
                .await
            {
                info!(agent_id = %agent_id, "Agent disconnected");
            }
        });

        Ok(Response::new(outbound))
    }

    async fn io_stream(
        &self,
        request: Request<Streaming<IoFrame>>,
    ) -> Result<Response<Self::IoStreamStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .next()
            .await
            .ok_or_else(|| Status::invalid_argument("no session frame"))?
            .map_err(|e| Status::internal(format!("stream error: {}", e)))?;
        if first.session_id.is_empty() {
            return Err(Status::invalid_argument(
                "first frame must carry a session id",
            ));
        }
        let session_id = first.session_id;

        let (to_agent, to_agent_rx) = mpsc::channel::<Bytes>(IO_BUFFER);
        let (from_agent_tx, from_agent) = mpsc::channel::<Bytes>(IO_BUFFER);
        self.state.sessions.attach_agent_side(
            &session_id,
            AgentHalf {
                to_agent,
                from_agent,
            },
        )?;
        info!(session_id = %session_id, "Agent attached to session");

        let pending = first.data;
        let reader_session = session_id.clone();
        tokio::spawn(async move {
            if !pending.is_empty() && from_agent_tx.send(Bytes::from(pending)).await.is_err() {
                return;
            }
            loop {
                let next = tokio::select! {
                    _ = from_agent_tx.closed() => break,
                    next = inbound.next() => next,
                };
                match next {
                    Some(Ok(frame)) => {
                        if from_agent_tx.send(Bytes::from(frame.data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %reader_session, error = %e, "IO stream error");
                        break;
                    }
                    None => break,
                }
            }
            debug!(session_id = %reader_session, "Agent IO reader finished");
        });

        let outbound = ReceiverStream::new(to_agent_rx).map(|data| {
            Ok::<_, Status>(IoFrame {
                session_id: String::new(),
                data: data.to_vec(),
            })
        });
        Ok(Response::new(Box::pin(outbound)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scheduler::engine::testing::RecordingEngine;
    use crate::session::SessionState;
    use lookout_proto::{Heartbeat, HostInfo, HostReport, TaskResult};

    fn state() -> Arc<ControlState> {
        ControlState::new(&Config::default(), Arc::new(RecordingEngine::default()))
    }

    async fn connect(state: &ControlState, agent_id: &str) -> OutboundTasks {
        let (stream, outbound) = TaskStream::channel(4);
        state
            .agents
            .upsert(AgentConnection::new(agent_id, "c1", stream, AgentMeta::default()))
            .await;
        outbound
    }

    #[tokio::test]
    async fn test_host_report_updates_registry() {
        let state = state();
        let _outbound = connect(&state, "A1").await;

        let report = agent_message::Payload::HostReport(HostReport {
            host: Some(HostInfo {
                platform: "freebsd".to_string(),
                agent_version: "0.9.1".to_string(),
                ..Default::default()
            }),
        });
        handle_agent_message(&state, "A1", "c1", report).await;
        handle_agent_message(
            &state,
            "A1",
            "c1",
            agent_message::Payload::Heartbeat(Heartbeat { timestamp_ms: 1 }),
        )
        .await;

        let summary = state.agents.get("A1").await.unwrap();
        assert_eq!(summary.platform, "freebsd");
        assert_eq!(summary.agent_version, "0.9.1");
    }

    #[tokio::test]
    async fn test_task_result_is_broadcast() {
        let state = state();
        let mut results = state.subscribe_results();

        let result = TaskResult {
            task_id: 12,
            kind: TaskKind::Command as i32,
            successful: true,
            data: "ok".to_string(),
            delay_ms: 3.5,
        };
        handle_agent_message(
            &state,
            "A1",
            "c1",
            agent_message::Payload::TaskResult(result.clone()),
        )
        .await;

        let received = results.recv().await.unwrap();
        assert_eq!(received.agent_id, "A1");
        assert_eq!(received.result, result);
    }

    #[tokio::test]
    async fn test_failed_open_session_closes_session() {
        let state = state();
        let session_id = state.sessions.create_session().unwrap();
        let mut watcher = state.sessions.subscribe(&session_id).unwrap();

        let result = TaskResult {
            task_id: 0,
            kind: TaskKind::OpenSession as i32,
            successful: false,
            data: session_id.clone(),
            delay_ms: 0.0,
        };
        handle_agent_message(&state, "A1", "c1", agent_message::Payload::TaskResult(result))
            .await;

        assert_eq!(state.sessions.state(&session_id), None);
        assert_eq!(*watcher.borrow_and_update(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_times_out_before_registration() {
        let mut inbound = futures::stream::pending::<Result<AgentMessage, Status>>();
        let started = tokio::time::Instant::now();

        let err = await_registration(&mut inbound, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::DeadlineExceeded);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_registration_must_come_first() {
        let heartbeat = AgentMessage {
            payload: Some(agent_message::Payload::Heartbeat(Heartbeat { timestamp_ms: 1 })),
        };
        let mut inbound = futures::stream::iter(vec![Ok::<_, Status>(heartbeat)]);
        let err = await_registration(&mut inbound, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let register = AgentMessage {
            payload: Some(agent_message::Payload::Register(Register {
                agent_id: "A1".to_string(),
                ..Default::default()
            })),
        };
        let mut inbound = futures::stream::iter(vec![Ok::<_, Status>(register)]);
        let register = await_registration(&mut inbound, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(register.agent_id, "A1");
    }
}
