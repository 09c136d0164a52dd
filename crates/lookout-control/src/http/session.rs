// ABOUTME: File-manager session endpoints: open a session, then bridge the browser WebSocket.
// ABOUTME: The socket becomes the user half of the session and is relayed to the agent.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ApiError, ApiResponse, ApiResult, AuthUser};
use crate::error::ControlError;
use crate::session::{Frame, SessionId, SessionState, UserHalf};
use crate::state::ControlState;

/// Buffer for each direction of a browser socket.
const WS_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    /// Agent to browse.
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    pub session_id: SessionId,
}

/// `GET /api/v1/file?id=<agent>`: allocate a session and ask the agent to join it.
pub async fn create_file_session(
    State(state): State<Arc<ControlState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<FileQuery>,
) -> ApiResult<SessionCreated> {
    let session_id = state.sessions.create_session()?;
    state
        .sessions
        .request_agent_open(&session_id, &query.id)
        .await?;
    debug!(user_id = user, agent_id = %query.id, session_id = %session_id, "File session requested");
    Ok(ApiResponse::ok(SessionCreated { session_id }))
}

/// `GET /api/v1/ws/file/:id`: upgrade and relay.
///
/// Unknown sessions and sessions that already have a browser are refused
/// before the upgrade.
pub async fn file_stream(
    State(state): State<Arc<ControlState>>,
    AuthUser(_): AuthUser,
    Path(session_id): Path<SessionId>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    match state.sessions.state(&session_id) {
        None => return Err(ControlError::not_found("session", session_id).into()),
        Some(SessionState::UserAttached | SessionState::Relaying) => {
            return Err(ControlError::InvalidState(format!(
                "session {session_id} already has a browser attached"
            ))
            .into())
        }
        Some(_) => {}
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws
        .on_upgrade(move |socket| bridge_socket(state, session_id, socket))
        .into_response())
}

async fn bridge_socket(state: Arc<ControlState>, session_id: SessionId, socket: WebSocket) {
    let sessions = state.sessions.clone();
    let attach_timeout = sessions.config().attach_timeout;
    let (mut sink, stream) = socket.split();

    if let Err(e) = sessions.wait_for_agent(&session_id, attach_timeout).await {
        warn!(session_id = %session_id, error = %e, "Agent never joined session");
        sessions.close_session(&session_id);
        send_close(&mut sink, close_code::AGAIN, "agent did not join the session").await;
        return;
    }

    let (to_user, to_user_rx) = mpsc::channel(WS_BUFFER);
    let (from_user_tx, from_user) = mpsc::channel(WS_BUFFER);
    if let Err(e) = sessions.attach_user_side(&session_id, UserHalf { to_user, from_user }) {
        warn!(session_id = %session_id, error = %e, "Browser could not join session");
        send_close(&mut sink, close_code::POLICY, "session is not available").await;
        return;
    }

    let writer = tokio::spawn(write_frames(sink, to_user_rx));
    let reader = tokio::spawn(read_frames(stream, from_user_tx));

    if let Err(e) = sessions.relay(&session_id).await {
        warn!(session_id = %session_id, error = %e, "Relay failed");
    }
    reader.abort();
    let _ = writer.await;
}

async fn send_close(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

async fn write_frames(mut sink: SplitSink<WebSocket, Message>, mut frames: mpsc::Receiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        let msg = match frame {
            Frame::Data(data) => Message::Binary(data.to_vec()),
            Frame::Ping => Message::Ping(Vec::new()),
        };
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_frames(mut stream: SplitStream<WebSocket>, to_relay: mpsc::Sender<Bytes>) {
    while let Some(Ok(msg)) = stream.next().await {
        let data = match msg {
            Message::Binary(data) => Bytes::from(data),
            Message::Text(text) => Bytes::from(text),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if to_relay.send(data).await.is_err() {
            break;
        }
    }
}
