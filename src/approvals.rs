//! Approval gate for capability-constrained actions
//!
//! Tracks pending/approved/denied requests. A request is resolved exactly
//! once; the decision appends an `approval.decided` event to the run branch
//! it parked and one audit entry. Stale pending requests are escalated to
//! operators, never auto-denied.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::audit::AuditChain;
use crate::error::{AppError, Result};
use crate::event_log::EventLog;
use crate::models::{
    ActorContext, ApprovalDecision, ApprovalRequest, ApprovalStatus, Capability, EventPayload,
    Role,
};

/// The run branch an approval request is parked on
#[derive(Debug, Clone, Copy)]
pub struct RunOrigin {
    pub run_id: Uuid,
    pub subtask: i64,
}

/// Gate over the approval-request table
#[derive(Clone)]
pub struct ApprovalGate {
    pool: SqlitePool,
    events: EventLog,
    audit: AuditChain,
    dedup_window: Duration,
}

impl ApprovalGate {
    pub fn new(pool: SqlitePool, events: EventLog, audit: AuditChain) -> Self {
        Self::with_dedup_window(pool, events, audit, Duration::seconds(60))
    }

    pub fn with_dedup_window(
        pool: SqlitePool,
        events: EventLog,
        audit: AuditChain,
        dedup_window: Duration,
    ) -> Self {
        Self {
            pool,
            events,
            audit,
            dedup_window,
        }
    }

    /// Create a pending request, or return the recent identical one.
    ///
    /// Idempotent under the same (workspace, actor, action) within the dedup
    /// window so a retried submission does not stack duplicate banners. A
    /// newly created request appends `approval.requested` to the originating
    /// run and one audit entry.
    pub async fn request_approval(
        &self,
        workspace_id: &str,
        actor_id: &str,
        capability: Capability,
        action: &str,
        reason: &str,
        origin: Option<RunOrigin>,
    ) -> Result<ApprovalRequest> {
        let cutoff = Utc::now() - self.dedup_window;
        let existing = sqlx::query_as::<_, ApprovalRow>(
            r#"
            SELECT id, workspace_id, actor_id, capability, action, reason, status, run_id, subtask, created_at, decided_at, decided_by, escalated_at
            FROM approval_requests
            WHERE workspace_id = ? AND actor_id = ? AND action = ? AND status = 'pending' AND created_at >= ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(workspace_id)
        .bind(actor_id)
        .bind(action)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            return row.try_into();
        }

        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO approval_requests (id, workspace_id, actor_id, capability, action, reason, status, run_id, subtask, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(workspace_id)
        .bind(actor_id)
        .bind(capability.as_str())
        .bind(action)
        .bind(reason)
        .bind(origin.map(|o| o.run_id.to_string()))
        .bind(origin.map(|o| o.subtask))
        .bind(now)
        .execute(&self.pool)
        .await?;

        if let Some(origin) = origin {
            self.events
                .append(
                    origin.run_id,
                    EventPayload::ApprovalRequested {
                        request_id: id,
                        subtask: origin.subtask,
                        capability,
                    },
                )
                .await?;
        }

        self.audit
            .record(
                workspace_id,
                actor_id,
                "approval.requested",
                "pending",
                serde_json::json!({
                    "approval_id": id,
                    "capability": capability.as_str(),
                    "action": action,
                }),
            )
            .await?;

        self.get(id).await
    }

    /// Resolve a pending request exactly once.
    ///
    /// Non-owners are rejected with `Forbidden` and the attempt is audited; a
    /// second decision fails with `AlreadyDecided` and leaves the first
    /// intact. The decision is appended to the originating run with a `fatal`
    /// flag derived from the run's fail-fast policy; if the run reached a
    /// terminal state in the meantime the event is discarded.
    pub async fn decide(
        &self,
        request_id: Uuid,
        decision: ApprovalDecision,
        decider: &ActorContext,
    ) -> Result<ApprovalRequest> {
        let request = self.get(request_id).await?;

        if decider.role != Role::Owner {
            self.audit
                .record(
                    &request.workspace_id,
                    &decider.user_id,
                    "approval.decide",
                    "forbidden",
                    serde_json::json!({"approval_id": request_id}),
                )
                .await?;
            return Err(AppError::Forbidden(
                "owner role required to decide approvals".to_string(),
            ));
        }

        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE approval_requests
            SET status = ?, decided_at = ?, decided_by = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(decision.as_status().as_str())
        .bind(now)
        .bind(&decider.user_id)
        .bind(request_id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::AlreadyDecided(request_id));
        }

        if let Some(run_id) = request.run_id {
            let run = self.events.get_run(run_id).await?;
            let fatal = decision == ApprovalDecision::Denied && run.fail_fast;
            let appended = self
                .events
                .append(
                    run_id,
                    EventPayload::ApprovalDecided {
                        request_id,
                        decision,
                        decided_by: decider.user_id.clone(),
                        fatal,
                    },
                )
                .await;
            match appended {
                Ok(_) => {}
                Err(AppError::RunTerminated(_)) => {
                    tracing::debug!(%run_id, %request_id, "run terminal, decision event discarded");
                }
                Err(e) => return Err(e),
            }
        }

        self.audit
            .record(
                &request.workspace_id,
                &decider.user_id,
                "approval.decided",
                decision.as_str(),
                serde_json::json!({"approval_id": request_id}),
            )
            .await?;

        self.get(request_id).await
    }

    pub async fn get(&self, request_id: Uuid) -> Result<ApprovalRequest> {
        let row = sqlx::query_as::<_, ApprovalRow>(
            r#"
            SELECT id, workspace_id, actor_id, capability, action, reason, status, run_id, subtask, created_at, decided_at, decided_by, escalated_at
            FROM approval_requests
            WHERE id = ?
            "#,
        )
        .bind(request_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::UnknownRequest(request_id))?;

        row.try_into()
    }

    pub async fn list(&self, workspace_id: &str) -> Result<Vec<ApprovalRequest>> {
        let rows = sqlx::query_as::<_, ApprovalRow>(
            r#"
            SELECT id, workspace_id, actor_id, capability, action, reason, status, run_id, subtask, created_at, decided_at, decided_by, escalated_at
            FROM approval_requests
            WHERE workspace_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Field-by-field verification of a client-supplied request id. The
    /// persisted request must match the workspace, actor, capability and
    /// action and be approved; anything else does not count.
    pub async fn is_approved(
        &self,
        request_id: Uuid,
        workspace_id: &str,
        actor_id: &str,
        capability: Capability,
        action: &str,
    ) -> Result<bool> {
        match self.get(request_id).await {
            Ok(request) => Ok(request.workspace_id == workspace_id
                && request.actor_id == actor_id
                && request.capability == capability
                && request.action == action
                && request.status == ApprovalStatus::Approved),
            Err(AppError::UnknownRequest(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The latest request for an action, regardless of status. Resume logic
    /// consults this so persisted state, not the client hint, is
    /// authoritative.
    pub async fn find_for_action(
        &self,
        workspace_id: &str,
        actor_id: &str,
        action: &str,
    ) -> Result<Option<ApprovalRequest>> {
        let row = sqlx::query_as::<_, ApprovalRow>(
            r#"
            SELECT id, workspace_id, actor_id, capability, action, reason, status, run_id, subtask, created_at, decided_at, decided_by, escalated_at
            FROM approval_requests
            WHERE workspace_id = ? AND actor_id = ? AND action = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(workspace_id)
        .bind(actor_id)
        .bind(action)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    /// Re-notify operators about pending requests older than `older_than`.
    /// Each request is escalated once; approval starvation stays a surfaced
    /// liveness concern, the request itself is left pending.
    pub async fn escalate_stale(&self, older_than: Duration) -> Result<Vec<ApprovalRequest>> {
        let cutoff = Utc::now() - older_than;
        let rows = sqlx::query_as::<_, ApprovalRow>(
            r#"
            SELECT id, workspace_id, actor_id, capability, action, reason, status, run_id, subtask, created_at, decided_at, decided_by, escalated_at
            FROM approval_requests
            WHERE status = 'pending' AND escalated_at IS NULL AND created_at <= ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut escalated = Vec::new();
        let now = Utc::now();
        for row in rows {
            let request: ApprovalRequest = row.try_into()?;
            sqlx::query("UPDATE approval_requests SET escalated_at = ? WHERE id = ?")
                .bind(now)
                .bind(request.id.to_string())
                .execute(&self.pool)
                .await?;

            tracing::warn!(
                request_id = %request.id,
                workspace_id = %request.workspace_id,
                action = %request.action,
                "approval request awaiting decision past the escalation threshold"
            );
            self.audit
                .record(
                    &request.workspace_id,
                    &request.actor_id,
                    "approval.escalated",
                    "pending",
                    serde_json::json!({"approval_id": request.id, "action": request.action}),
                )
                .await?;
            escalated.push(request);
        }

        Ok(escalated)
    }
}

// Internal row type for sqlx

#[derive(sqlx::FromRow)]
struct ApprovalRow {
    id: String,
    workspace_id: String,
    actor_id: String,
    capability: String,
    action: String,
    reason: String,
    status: String,
    run_id: Option<String>,
    subtask: Option<i64>,
    created_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
    decided_by: Option<String>,
    escalated_at: Option<DateTime<Utc>>,
}

impl TryFrom<ApprovalRow> for ApprovalRequest {
    type Error = AppError;

    fn try_from(row: ApprovalRow) -> Result<Self> {
        let run_id = row
            .run_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| AppError::Internal(format!("Invalid run UUID: {}", e)))?;

        Ok(ApprovalRequest {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| AppError::Internal(format!("Invalid request UUID: {}", e)))?,
            workspace_id: row.workspace_id,
            actor_id: row.actor_id,
            capability: row
                .capability
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid capability: {}", e)))?,
            action: row.action,
            reason: row.reason,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid approval status: {}", e)))?,
            run_id,
            subtask: row.subtask,
            created_at: row.created_at,
            decided_at: row.decided_at,
            decided_by: row.decided_by,
            escalated_at: row.escalated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (ApprovalGate, EventLog, AuditChain) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        let events = EventLog::new(pool.clone());
        let audit = AuditChain::new(pool.clone());
        let gate = ApprovalGate::new(pool, events.clone(), audit.clone());
        (gate, events, audit)
    }

    fn owner() -> ActorContext {
        ActorContext::new("owner-1", Role::Owner)
    }

    fn member() -> ActorContext {
        ActorContext::new("member-1", Role::Member)
    }

    async fn started_run(events: &EventLog) -> Uuid {
        let run = events
            .create_run("ws-1", "user-1", "sample", false)
            .await
            .unwrap();
        events
            .append(
                run.id,
                EventPayload::RunStarted {
                    goal: "sample".to_string(),
                    actor_id: "user-1".to_string(),
                },
            )
            .await
            .unwrap();
        run.id
    }

    #[tokio::test]
    async fn test_request_creates_pending() {
        let (gate, events, _) = setup().await;
        let run_id = started_run(&events).await;

        let request = gate
            .request_approval(
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample",
                "high-impact delegation requires explicit approval",
                Some(RunOrigin { run_id, subtask: 0 }),
            )
            .await
            .unwrap();

        assert_eq!(request.status, ApprovalStatus::Pending);
        assert_eq!(request.run_id, Some(run_id));
        assert_eq!(request.subtask, Some(0));

        // The correlated event parked the run.
        let run = events.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::AwaitingApproval);
    }

    #[tokio::test]
    async fn test_request_dedup_within_window() {
        let (gate, events, _) = setup().await;
        let run_id = started_run(&events).await;

        let first = gate
            .request_approval(
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample",
                "reason",
                Some(RunOrigin { run_id, subtask: 0 }),
            )
            .await
            .unwrap();
        let second = gate
            .request_approval(
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample",
                "reason",
                Some(RunOrigin { run_id, subtask: 0 }),
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);

        // Only one approval.requested event was appended.
        let run_events = events.read(run_id, 1).await.unwrap();
        let requested = run_events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::ApprovalRequested { .. }))
            .count();
        assert_eq!(requested, 1);
    }

    #[tokio::test]
    async fn test_request_outside_window_creates_new() {
        let (gate, events, audit) = setup().await;
        let gate = ApprovalGate::with_dedup_window(
            gate.pool.clone(),
            events.clone(),
            audit,
            Duration::zero(),
        );
        let run_id = started_run(&events).await;

        let first = gate
            .request_approval(
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample",
                "reason",
                Some(RunOrigin { run_id, subtask: 0 }),
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = gate
            .request_approval(
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample",
                "reason",
                Some(RunOrigin { run_id, subtask: 0 }),
            )
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_decide_approves_once() {
        let (gate, events, _) = setup().await;
        let run_id = started_run(&events).await;

        let request = gate
            .request_approval(
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample",
                "reason",
                Some(RunOrigin { run_id, subtask: 0 }),
            )
            .await
            .unwrap();

        let decided = gate
            .decide(request.id, ApprovalDecision::Approved, &owner())
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(decided.decided_by.as_deref(), Some("owner-1"));
        assert!(decided.decided_at.is_some());

        // The run resumed.
        let run = events.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_double_decide_fails_and_keeps_first() {
        let (gate, events, _) = setup().await;
        let run_id = started_run(&events).await;

        let request = gate
            .request_approval(
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample",
                "reason",
                Some(RunOrigin { run_id, subtask: 0 }),
            )
            .await
            .unwrap();

        gate.decide(request.id, ApprovalDecision::Approved, &owner())
            .await
            .unwrap();
        let result = gate
            .decide(request.id, ApprovalDecision::Denied, &owner())
            .await;
        assert!(matches!(result.unwrap_err(), AppError::AlreadyDecided(_)));

        let unchanged = gate.get(request.id).await.unwrap();
        assert_eq!(unchanged.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_decide_requires_owner_and_audits_attempt() {
        let (gate, events, audit) = setup().await;
        let run_id = started_run(&events).await;

        let request = gate
            .request_approval(
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample",
                "reason",
                Some(RunOrigin { run_id, subtask: 0 }),
            )
            .await
            .unwrap();

        let result = gate
            .decide(request.id, ApprovalDecision::Approved, &member())
            .await;
        assert!(matches!(result.unwrap_err(), AppError::Forbidden(_)));

        let unchanged = gate.get(request.id).await.unwrap();
        assert_eq!(unchanged.status, ApprovalStatus::Pending);

        let entries = audit.list("ws-1", i64::MAX).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.action == "approval.decide" && e.outcome == "forbidden"));
    }

    #[tokio::test]
    async fn test_decide_unknown_request() {
        let (gate, _, _) = setup().await;
        let result = gate
            .decide(Uuid::new_v4(), ApprovalDecision::Approved, &owner())
            .await;
        assert!(matches!(result.unwrap_err(), AppError::UnknownRequest(_)));
    }

    #[tokio::test]
    async fn test_is_approved_verifies_fields() {
        let (gate, events, _) = setup().await;
        let run_id = started_run(&events).await;

        let request = gate
            .request_approval(
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample",
                "reason",
                Some(RunOrigin { run_id, subtask: 0 }),
            )
            .await
            .unwrap();

        // Not approved yet.
        assert!(!gate
            .is_approved(
                request.id,
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample"
            )
            .await
            .unwrap());

        gate.decide(request.id, ApprovalDecision::Approved, &owner())
            .await
            .unwrap();

        assert!(gate
            .is_approved(
                request.id,
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample"
            )
            .await
            .unwrap());

        // Any field mismatch rejects the hint.
        assert!(!gate
            .is_approved(
                request.id,
                "ws-2",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample"
            )
            .await
            .unwrap());
        assert!(!gate
            .is_approved(
                request.id,
                "ws-1",
                "someone-else",
                Capability::RunTool,
                "delegate:spec-1:sample"
            )
            .await
            .unwrap());
        assert!(!gate
            .is_approved(
                request.id,
                "ws-1",
                "user-1",
                Capability::ExternalAction,
                "delegate:spec-1:sample"
            )
            .await
            .unwrap());
        assert!(!gate
            .is_approved(
                request.id,
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-2:sample"
            )
            .await
            .unwrap());
        assert!(!gate
            .is_approved(
                Uuid::new_v4(),
                "ws-1",
                "user-1",
                Capability::RunTool,
                "delegate:spec-1:sample"
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_escalate_stale_is_one_shot() {
        let (gate, events, audit) = setup().await;
        let run_id = started_run(&events).await;

        gate.request_approval(
            "ws-1",
            "user-1",
            Capability::RunTool,
            "delegate:spec-1:sample",
            "reason",
            Some(RunOrigin { run_id, subtask: 0 }),
        )
        .await
        .unwrap();

        let escalated = gate.escalate_stale(Duration::zero()).await.unwrap();
        assert_eq!(escalated.len(), 1);

        // Still pending, not auto-denied.
        let request = gate.get(escalated[0].id).await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert!(request.escalated_at.is_some());

        // Second sweep finds nothing new.
        let again = gate.escalate_stale(Duration::zero()).await.unwrap();
        assert!(again.is_empty());

        let entries = audit.list("ws-1", i64::MAX).await.unwrap();
        let count = entries
            .iter()
            .filter(|e| e.action == "approval.escalated")
            .count();
        assert_eq!(count, 1);
    }
}
