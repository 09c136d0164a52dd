// ABOUTME: TaskMessage, the typed one-shot command pushed down an agent stream.
// ABOUTME: Constructors for each command kind and conversion to the wire Task.

use bytes::Bytes;
use lookout_proto::{server_message, ServerMessage, Task, TaskKind};
use serde::{Deserialize, Serialize};

/// A command for one or more agents. The payload is opaque to the control
/// plane beyond its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    pub id: u64,
    pub kind: TaskKind,
    pub payload: Bytes,
}

/// Payload of an [`TaskKind::OpenSession`] task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionPayload {
    pub session_id: String,
}

impl TaskMessage {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            id: 0,
            kind,
            payload: Bytes::new(),
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Run a shell command; the task ID is the scheduled job's ID so results
    /// can be matched back to it.
    pub fn command(job_id: u64, command: &str) -> Self {
        Self::new(TaskKind::Command)
            .with_id(job_id)
            .with_payload(command.as_bytes().to_vec())
    }

    pub fn open_session(session_id: &str) -> Self {
        let payload = OpenSessionPayload {
            session_id: session_id.to_string(),
        };
        // Serializing a struct of one String cannot fail.
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        Self::new(TaskKind::OpenSession).with_payload(bytes)
    }

    pub fn upgrade() -> Self {
        Self::new(TaskKind::Upgrade)
    }

    pub fn keepalive() -> Self {
        Self::new(TaskKind::Keepalive)
    }

    pub fn report_host_info() -> Self {
        Self::new(TaskKind::ReportHostInfo)
    }

    pub fn to_proto(&self) -> Task {
        Task {
            id: self.id,
            kind: self.kind as i32,
            data: self.payload.to_vec(),
        }
    }

    /// Wrap for sending on an agent stream.
    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage {
            payload: Some(server_message::Payload::Task(self.to_proto())),
        }
    }
}
