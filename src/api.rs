//! HTTP surface exposed to the UI/transport layer

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::ChainReport;
use crate::error::{AppError, Result};
use crate::models::{
    ActorContext, ApprovalDecision, ApprovalRequest, AuditEvent, Capability, EventPayload,
    EventType, Role, SpecialistAgent, Workspace, WorkspaceMember,
};
use crate::replay::RunView;
use crate::scheduler::DelegatedResult;
use crate::specialists::SpecialistDraft;
use crate::AppState;

const MAX_TEXT_LEN: usize = 2_000;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/workspaces/:workspace_id", patch(rename_workspace))
        .route(
            "/workspaces/:workspace_id/members",
            get(list_members).post(add_member),
        )
        .route(
            "/workspaces/:workspace_id/specialists",
            get(list_specialists).post(upsert_specialist),
        )
        .route(
            "/workspaces/:workspace_id/companion/messages",
            post(companion_message),
        )
        .route(
            "/workspaces/:workspace_id/execution/goals",
            post(execute_goal),
        )
        .route("/workspaces/:workspace_id/approvals", get(list_approvals))
        .route(
            "/workspaces/:workspace_id/audit-events",
            get(list_audit_events),
        )
        .route(
            "/workspaces/:workspace_id/audit/verify",
            get(verify_audit_chain),
        )
        .route("/agent-runs/:run_id", get(get_run_view))
        .route("/agent-runs/:run_id/events", get(run_timeline))
        .route("/agent-runs/:run_id/cancel", post(cancel_run))
        .route("/approvals/:request_id/decision", post(decide_approval))
}

async fn health() -> &'static str {
    "ok"
}

// Actor identification from transport headers. Authentication itself is
// handled upstream; these headers carry the already-established identity.

#[axum::async_trait]
impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let user_id = header_value(parts, "x-user-id")?;
        let role = header_value(parts, "x-user-role")?
            .parse::<Role>()
            .map_err(|_| AppError::BadRequest("x-user-role must be owner or member".to_string()))?;
        Ok(ActorContext { user_id, role })
    }
}

fn header_value(parts: &Parts, name: &str) -> Result<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| {
            AppError::Unauthorized("x-user-id and x-user-role headers are required".to_string())
        })
}

fn require_owner(actor: &ActorContext) -> Result<()> {
    if actor.role != Role::Owner {
        return Err(AppError::Forbidden("owner role required".to_string()));
    }
    Ok(())
}

fn validate_text(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{} must not be empty", field)));
    }
    if value.len() > MAX_TEXT_LEN {
        return Err(AppError::BadRequest(format!(
            "{} must be at most {} characters",
            field, MAX_TEXT_LEN
        )));
    }
    Ok(())
}

// Wire types

#[derive(Debug, Deserialize)]
pub struct CompanionMessageRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CompanionMessageResponse {
    pub response: String,
    pub memory_hits: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SpecialistPayload {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub soul: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionGoalRequest {
    pub goal: String,
    #[serde(default)]
    pub approved_request_ids: Vec<Uuid>,
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Serialize)]
pub struct ExecutionGoalResponse {
    pub agent_run_id: Uuid,
    pub summary: String,
    pub delegated_results: Vec<DelegatedResult>,
    pub requires_approval: bool,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalDecisionRequest {
    pub decision: ApprovalDecision,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameWorkspaceRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    #[serde(default)]
    pub last_seq: i64,
}

#[derive(Debug, Serialize)]
pub struct TimelineEvent {
    pub seq: i64,
    pub event_type: EventType,
    pub payload: EventPayload,
    pub created_at: DateTime<Utc>,
}

// Handlers

async fn rename_workspace(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    actor: ActorContext,
    Json(payload): Json<RenameWorkspaceRequest>,
) -> Result<Json<Workspace>> {
    state.directory.ensure_access(&workspace_id, &actor).await?;
    require_owner(&actor)?;
    validate_text(&payload.name, "name")?;

    let workspace = state.directory.rename(&workspace_id, &payload.name).await?;
    state
        .audit
        .record(
            &workspace_id,
            &actor.user_id,
            "workspace.renamed",
            "success",
            serde_json::json!({"name": payload.name}),
        )
        .await?;
    Ok(Json(workspace))
}

async fn list_members(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    actor: ActorContext,
) -> Result<Json<Vec<WorkspaceMember>>> {
    state.directory.ensure_access(&workspace_id, &actor).await?;
    require_owner(&actor)?;
    Ok(Json(state.directory.list_members(&workspace_id).await?))
}

async fn add_member(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    actor: ActorContext,
    Json(payload): Json<AddMemberRequest>,
) -> Result<(StatusCode, Json<WorkspaceMember>)> {
    state.directory.ensure_access(&workspace_id, &actor).await?;
    require_owner(&actor)?;
    validate_text(&payload.user_id, "user_id")?;

    let member = state
        .directory
        .add_member(&workspace_id, &payload.user_id)
        .await?;
    state
        .audit
        .record(
            &workspace_id,
            &actor.user_id,
            "member.added",
            "success",
            serde_json::json!({"user_id": payload.user_id}),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(member)))
}

async fn list_specialists(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    actor: ActorContext,
) -> Result<Json<Vec<SpecialistAgent>>> {
    state.directory.ensure_access(&workspace_id, &actor).await?;
    Ok(Json(state.specialists.list(&workspace_id).await?))
}

async fn upsert_specialist(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    actor: ActorContext,
    Json(payload): Json<SpecialistPayload>,
) -> Result<(StatusCode, Json<SpecialistAgent>)> {
    state.directory.ensure_access(&workspace_id, &actor).await?;
    validate_text(&payload.id, "id")?;
    validate_text(&payload.name, "name")?;
    validate_text(&payload.prompt, "prompt")?;
    validate_text(&payload.soul, "soul")?;

    let decision = state.policy.can_edit_specialists(&actor);
    if !decision.allowed {
        state
            .audit
            .record(
                &workspace_id,
                &actor.user_id,
                "specialist.upsert",
                "forbidden",
                serde_json::json!({"specialist_id": payload.id}),
            )
            .await?;
        return Err(AppError::Forbidden(
            decision
                .reason
                .unwrap_or_else(|| "not allowed to edit specialists".to_string()),
        ));
    }

    let stored = state
        .specialists
        .upsert(
            &workspace_id,
            SpecialistDraft {
                id: payload.id,
                name: payload.name,
                prompt: payload.prompt,
                soul: payload.soul,
                capabilities: payload.capabilities,
            },
        )
        .await?;

    state
        .audit
        .record(
            &workspace_id,
            &actor.user_id,
            "specialist.upserted",
            "success",
            serde_json::json!({
                "specialist_id": stored.id,
                "capabilities": stored.capabilities.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            }),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(stored)))
}

async fn companion_message(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    actor: ActorContext,
    Json(payload): Json<CompanionMessageRequest>,
) -> Result<Json<CompanionMessageResponse>> {
    state.directory.ensure_access(&workspace_id, &actor).await?;
    validate_text(&payload.message, "message")?;

    let memory_id = format!("memory-{}", Uuid::new_v4());
    state
        .memory
        .upsert(&workspace_id, "companion_primary", &memory_id, &payload.message)
        .await?;

    let matches = state
        .memory
        .search(&workspace_id, "companion_primary", &payload.message, 3)
        .await?;
    let memory_hits: Vec<String> = matches.into_iter().map(|m| m.memory_id).collect();

    let completion = state
        .completion
        .complete("companion_primary", &payload.message)
        .await?;
    let response = format!(
        "I hear you, {}. {} ({} memory hit(s)).",
        actor.user_id,
        completion,
        memory_hits.len()
    );

    state
        .audit
        .record(
            &workspace_id,
            &actor.user_id,
            "companion.message",
            "success",
            serde_json::json!({"memory_hit_count": memory_hits.len()}),
        )
        .await?;

    Ok(Json(CompanionMessageResponse {
        response,
        memory_hits,
    }))
}

async fn execute_goal(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    actor: ActorContext,
    Json(payload): Json<ExecutionGoalRequest>,
) -> Result<Json<ExecutionGoalResponse>> {
    state.directory.ensure_access(&workspace_id, &actor).await?;
    validate_text(&payload.goal, "goal")?;

    let outcome = state
        .scheduler
        .submit_goal(
            &workspace_id,
            &actor,
            &payload.goal,
            &payload.approved_request_ids,
            payload.fail_fast,
        )
        .await?;

    Ok(Json(ExecutionGoalResponse {
        agent_run_id: outcome.run.id,
        summary: outcome.summary,
        delegated_results: outcome.delegated_results,
        requires_approval: outcome.requires_approval,
    }))
}

async fn list_approvals(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    actor: ActorContext,
) -> Result<Json<Vec<ApprovalRequest>>> {
    state.directory.ensure_access(&workspace_id, &actor).await?;
    require_owner(&actor)?;
    Ok(Json(state.gate.list(&workspace_id).await?))
}

async fn decide_approval(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
    actor: ActorContext,
    Json(payload): Json<ApprovalDecisionRequest>,
) -> Result<Json<ApprovalRequest>> {
    let request = state.gate.get(request_id).await?;
    state
        .directory
        .ensure_access(&request.workspace_id, &actor)
        .await?;

    let decided = state.gate.decide(request_id, payload.decision, &actor).await?;
    Ok(Json(decided))
}

async fn list_audit_events(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    actor: ActorContext,
) -> Result<Json<Vec<AuditEvent>>> {
    state.directory.ensure_access(&workspace_id, &actor).await?;
    require_owner(&actor)?;
    Ok(Json(state.audit.list(&workspace_id, 100).await?))
}

async fn verify_audit_chain(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    actor: ActorContext,
) -> Result<Json<ChainReport>> {
    state.directory.ensure_access(&workspace_id, &actor).await?;
    require_owner(&actor)?;
    Ok(Json(state.audit.verify(&workspace_id).await?))
}

async fn get_run_view(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
    actor: ActorContext,
) -> Result<Json<RunView>> {
    let run = state.events.get_run(run_id).await?;
    state.directory.ensure_access(&run.workspace_id, &actor).await?;
    Ok(Json(state.replay.replay(run_id).await?))
}

async fn run_timeline(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<TimelineQuery>,
    actor: ActorContext,
) -> Result<Json<Vec<TimelineEvent>>> {
    if query.last_seq < 0 {
        return Err(AppError::BadRequest("last_seq must be >= 0".to_string()));
    }

    let run = state.events.get_run(run_id).await?;
    state.directory.ensure_access(&run.workspace_id, &actor).await?;

    let events = state.events.read(run_id, query.last_seq + 1).await?;
    let timeline = events
        .into_iter()
        .map(|e| TimelineEvent {
            seq: e.seq,
            event_type: e.event_type,
            payload: e.payload,
            created_at: e.created_at,
        })
        .collect();
    Ok(Json(timeline))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
    actor: ActorContext,
) -> Result<Json<crate::models::AgentRun>> {
    let run = state.events.get_run(run_id).await?;
    state.directory.ensure_access(&run.workspace_id, &actor).await?;
    Ok(Json(state.scheduler.cancel_run(run_id, &actor).await?))
}
