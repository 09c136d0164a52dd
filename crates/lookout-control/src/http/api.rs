// ABOUTME: JSON endpoints for agents, force update, cron jobs, API tokens and deletes.
// ABOUTME: Thin wrappers over the registries, dispatcher and scheduler bridge.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ApiError, ApiResponse, ApiResult, AuthUser};
use crate::dispatch::DispatchReport;
use crate::error::ControlError;
use crate::registry::{AgentSummary, ApiToken, JobId, ScheduledJob, UserId};
use crate::scheduler::SchedulerBridge;
use crate::state::ControlState;
use crate::task::TaskMessage;

/// `GET /api/v1/agents`
pub async fn list_agents(
    State(state): State<Arc<ControlState>>,
    AuthUser(_): AuthUser,
) -> ApiResult<Vec<AgentSummary>> {
    Ok(ApiResponse::ok(state.agents.snapshot().await))
}

/// `POST /api/v1/force-update` with a JSON list of agent IDs.
pub async fn force_update(
    State(state): State<Arc<ControlState>>,
    AuthUser(user): AuthUser,
    Json(agent_ids): Json<Vec<String>>,
) -> ApiResult<DispatchReport> {
    let report = state
        .dispatcher
        .dispatch_many(&agent_ids, TaskMessage::upgrade())
        .await;
    info!(
        user_id = user,
        targets = report.len(),
        delivered = report.delivered(),
        "Force update requested"
    );
    Ok(ApiResponse::ok(report))
}

#[derive(Debug, Serialize)]
pub struct JobSaved {
    pub id: JobId,
}

/// `POST /api/v1/cron`: add or edit a job.
pub async fn upsert_cron(
    State(state): State<Arc<ControlState>>,
    AuthUser(_): AuthUser,
    Json(job): Json<ScheduledJob>,
) -> ApiResult<JobSaved> {
    SchedulerBridge::validate(&job)?;
    let id = job.id;
    state.scheduler.register(job).await?;
    Ok(ApiResponse::ok(JobSaved { id }))
}

/// `GET /api/v1/cron/:id/manual`
pub async fn manual_cron(
    State(state): State<Arc<ControlState>>,
    AuthUser(_): AuthUser,
    Path(id): Path<JobId>,
) -> ApiResult<DispatchReport> {
    Ok(ApiResponse::ok(state.scheduler.manual_fire(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct IssueToken {
    #[serde(default)]
    pub note: String,
}

/// `GET /api/v1/token`: the caller's own tokens.
pub async fn list_tokens(
    State(state): State<Arc<ControlState>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Vec<ApiToken>> {
    Ok(ApiResponse::ok(state.tokens.list_for_user(user).await))
}

/// `POST /api/v1/token`
pub async fn issue_token(
    State(state): State<Arc<ControlState>>,
    AuthUser(user): AuthUser,
    Json(request): Json<IssueToken>,
) -> ApiResult<ApiToken> {
    let token = state.tokens.issue(user, request.note).await;
    info!(user_id = user, "API token issued");
    Ok(ApiResponse::ok(token))
}

/// `DELETE /api/v1/token/:token`. Tokens of other users are reported as
/// missing.
pub async fn revoke_token(
    State(state): State<Arc<ControlState>>,
    AuthUser(user): AuthUser,
    Path(token): Path<String>,
) -> ApiResult<ApiToken> {
    let owned = state
        .tokens
        .get(&token)
        .await
        .is_some_and(|t| t.user_id == user);
    if !owned {
        return Err(ControlError::not_found("token", token).into());
    }
    let removed = state.tokens.remove(&token).await?;
    info!(user_id = user, "API token revoked");
    Ok(ApiResponse::ok(removed))
}

/// Entity kinds accepted by the delete endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Agent,
    Cron,
    User,
}

impl EntityKind {
    /// Remove one entity and its derived index entries. Returns whether
    /// anything was removed.
    pub async fn evict(self, state: &ControlState, id: &str) -> Result<bool, ApiError> {
        match self {
            EntityKind::Agent => Ok(state.agents.remove(id).await),
            EntityKind::Cron => Ok(state.scheduler.unregister(parse_id(id)?).await),
            EntityKind::User => {
                let user: UserId = parse_id(id)?;
                Ok(state.tokens.remove_user(user).await > 0)
            }
        }
    }
}

fn parse_id(id: &str) -> Result<u64, ApiError> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid numeric id: {id:?}")))
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub kind: EntityKind,
    pub id: String,
    pub removed: bool,
}

/// `DELETE /api/v1/entities/:kind/:id`
pub async fn delete_entity(
    State(state): State<Arc<ControlState>>,
    AuthUser(user): AuthUser,
    Path((kind, id)): Path<(EntityKind, String)>,
) -> ApiResult<Deleted> {
    let removed = kind.evict(&state, &id).await?;
    info!(user_id = user, kind = ?kind, id = %id, removed, "Entity deleted");
    Ok(ApiResponse::ok(Deleted { kind, id, removed }))
}
