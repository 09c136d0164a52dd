// ABOUTME: Error taxonomy for control-plane operations.
// ABOUTME: Maps each variant onto gRPC status codes for the agent-facing service.

use thiserror::Error;

/// Errors surfaced by registries, dispatch, sessions and the scheduler bridge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Unknown agent, session, token or job.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate registration of something that must be unique.
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// Operation not allowed in the entity's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Agent is offline or its stream refused the write.
    #[error("agent {agent_id} unreachable: {reason}")]
    Unreachable { agent_id: String, reason: String },

    /// A configured capacity limit was hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A definition was rejected before it reached any registry.
    #[error("invalid definition: {0}")]
    Invalid(String),

    /// Unexpected I/O or protocol failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ControlError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn unreachable(agent_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ControlError::Unreachable {
            agent_id: agent_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<ControlError> for tonic::Status {
    fn from(err: ControlError) -> Self {
        let message = err.to_string();
        match err {
            ControlError::NotFound { .. } => tonic::Status::not_found(message),
            ControlError::AlreadyExists { .. } => tonic::Status::already_exists(message),
            ControlError::InvalidState(_) => tonic::Status::failed_precondition(message),
            ControlError::Unreachable { .. } => tonic::Status::unavailable(message),
            ControlError::ResourceExhausted(_) => tonic::Status::resource_exhausted(message),
            ControlError::Invalid(_) => tonic::Status::invalid_argument(message),
            ControlError::Internal(_) => tonic::Status::internal(message),
        }
    }
}

pub type Result<T, E = ControlError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ControlError::not_found("session", "abc");
        assert_eq!(err.to_string(), "session not found: abc");

        let err = ControlError::unreachable("a1", "offline");
        assert_eq!(err.to_string(), "agent a1 unreachable: offline");
    }

    #[test]
    fn test_into_status_codes() {
        let status: tonic::Status = ControlError::not_found("agent", "x").into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = ControlError::InvalidState("attached twice".into()).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status = ControlError::unreachable("a1", "closed").into();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status: tonic::Status = ControlError::ResourceExhausted("cap".into()).into();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);

        let status: tonic::Status = ControlError::Invalid("bad cron".into()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
