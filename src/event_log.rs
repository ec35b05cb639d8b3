//! Append-only, per-run ordered event log
//!
//! Seq assignment is serialized through one exclusive critical section per
//! run: the counter lives on the run row and is only ever advanced inside the
//! append transaction while the run's lock is held. Appends to different runs
//! proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{AgentRun, AgentRunEvent, EventPayload, RunStatus};

/// Event log over the per-workspace run tables
#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
    run_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl EventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            run_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a run in `pending` state with its seq counter at 1.
    pub async fn create_run(
        &self,
        workspace_id: &str,
        actor_id: &str,
        goal: &str,
        fail_fast: bool,
    ) -> Result<AgentRun> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO agent_runs (id, workspace_id, actor_id, goal, status, fail_fast, next_seq, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(workspace_id)
        .bind(actor_id)
        .bind(goal)
        .bind(RunStatus::Pending.as_str())
        .bind(fail_fast)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(AgentRun {
            id,
            workspace_id: workspace_id.to_string(),
            actor_id: actor_id.to_string(),
            goal: goal.to_string(),
            status: RunStatus::Pending,
            fail_fast,
            next_seq: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<AgentRun> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, workspace_id, actor_id, goal, status, fail_fast, next_seq, created_at, updated_at
            FROM agent_runs
            WHERE id = ?
            "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::UnknownRun(run_id))?;

        row.try_into()
    }

    /// The most recent non-terminal run for this goal, if one exists.
    /// Resubmitting the same goal resumes it instead of starting over.
    pub async fn find_active(&self, workspace_id: &str, goal: &str) -> Result<Option<AgentRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, workspace_id, actor_id, goal, status, fail_fast, next_seq, created_at, updated_at
            FROM agent_runs
            WHERE workspace_id = ? AND goal = ? AND status IN ('pending', 'running', 'awaiting_approval')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(workspace_id)
        .bind(goal)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    /// Append the next event for a run, assigning its seq atomically.
    ///
    /// Fails with `UnknownRun` if the run does not exist, `RunTerminated` if
    /// the run already reached `completed`/`failed`, and `InvalidTransition`
    /// if the event is not legal from the current status. The run status is
    /// advanced in the same transaction.
    pub async fn append(&self, run_id: Uuid, payload: EventPayload) -> Result<AgentRunEvent> {
        let lock = self.run_lock(run_id).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, workspace_id, actor_id, goal, status, fail_fast, next_seq, created_at, updated_at
            FROM agent_runs
            WHERE id = ?
            "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::UnknownRun(run_id))?;

        let run: AgentRun = row.try_into()?;
        if run.status.is_terminal() {
            return Err(AppError::RunTerminated(run_id));
        }
        let next_status = run
            .status
            .transition(&payload)
            .map_err(AppError::InvalidTransition)?;

        let seq = run.next_seq;
        let event_type = payload.event_type();
        let payload_json = serde_json::to_string(&payload)
            .map_err(|e| AppError::Internal(format!("Failed to serialize payload: {}", e)))?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO agent_run_events (run_id, seq, event_type, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id.to_string())
        .bind(seq)
        .bind(event_type.as_str())
        .bind(&payload_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE agent_runs SET status = ?, next_seq = ?, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(next_status.as_str())
        .bind(seq + 1)
        .bind(now)
        .bind(run_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AgentRunEvent {
            run_id,
            seq,
            event_type,
            payload,
            created_at: now,
        })
    }

    /// Snapshot read of all events with `seq >= from_seq`, ascending.
    /// Restartable: callers re-invoke with a larger `from_seq` to continue.
    pub async fn read(&self, run_id: Uuid, from_seq: i64) -> Result<Vec<AgentRunEvent>> {
        // Distinguish an empty run from an unknown one.
        self.get_run(run_id).await?;

        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT run_id, seq, event_type, payload, created_at
            FROM agent_run_events
            WHERE run_id = ? AND seq >= ?
            ORDER BY seq ASC
            "#,
        )
        .bind(run_id.to_string())
        .bind(from_seq)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    workspace_id: String,
    actor_id: String,
    goal: String,
    status: String,
    fail_fast: bool,
    next_seq: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for AgentRun {
    type Error = AppError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(AgentRun {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| AppError::Internal(format!("Invalid run UUID: {}", e)))?,
            workspace_id: row.workspace_id,
            actor_id: row.actor_id,
            goal: row.goal,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid run status: {}", e)))?,
            fail_fast: row.fail_fast,
            next_seq: row.next_seq,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    run_id: String,
    seq: i64,
    event_type: String,
    payload: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for AgentRunEvent {
    type Error = AppError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(AgentRunEvent {
            run_id: Uuid::parse_str(&row.run_id)
                .map_err(|e| AppError::Internal(format!("Invalid run UUID: {}", e)))?,
            seq: row.seq,
            event_type: row
                .event_type
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid event type: {}", e)))?,
            payload: serde_json::from_str(&row.payload)
                .map_err(|e| AppError::Internal(format!("Invalid event payload: {}", e)))?,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskOutcome;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_log() -> EventLog {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        EventLog::new(pool)
    }

    fn started(goal: &str) -> EventPayload {
        EventPayload::RunStarted {
            goal: goal.to_string(),
            actor_id: "user-1".to_string(),
        }
    }

    fn delegated(subtask: i64) -> EventPayload {
        EventPayload::TaskDelegated {
            subtask,
            specialist_id: "spec-1".to_string(),
            task: format!("Subtask {}", subtask + 1),
        }
    }

    #[tokio::test]
    async fn test_create_run_starts_pending() {
        let log = setup_log().await;
        let run = log
            .create_run("ws-1", "user-1", "sample", false)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.next_seq, 1);

        let fetched = log.get_run(run.id).await.unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.goal, "sample");
    }

    #[tokio::test]
    async fn test_get_run_unknown() {
        let log = setup_log().await;
        let result = log.get_run(Uuid::new_v4()).await;
        assert!(matches!(result.unwrap_err(), AppError::UnknownRun(_)));
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_seqs() {
        let log = setup_log().await;
        let run = log
            .create_run("ws-1", "user-1", "sample", false)
            .await
            .unwrap();

        let first = log.append(run.id, started("sample")).await.unwrap();
        assert_eq!(first.seq, 1);

        let second = log.append(run.id, delegated(0)).await.unwrap();
        assert_eq!(second.seq, 2);

        let events = log.read(run.id, 1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
    }

    #[tokio::test]
    async fn test_append_updates_run_status() {
        let log = setup_log().await;
        let run = log
            .create_run("ws-1", "user-1", "sample", false)
            .await
            .unwrap();

        log.append(run.id, started("sample")).await.unwrap();
        let fetched = log.get_run(run.id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Running);

        log.append(
            run.id,
            EventPayload::RunCompleted {
                summary: "done".to_string(),
            },
        )
        .await
        .unwrap();
        let fetched = log.get_run(run.id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_append_unknown_run() {
        let log = setup_log().await;
        let result = log.append(Uuid::new_v4(), started("sample")).await;
        assert!(matches!(result.unwrap_err(), AppError::UnknownRun(_)));
    }

    #[tokio::test]
    async fn test_append_after_terminal_rejected() {
        let log = setup_log().await;
        let run = log
            .create_run("ws-1", "user-1", "sample", false)
            .await
            .unwrap();

        log.append(run.id, started("sample")).await.unwrap();
        log.append(
            run.id,
            EventPayload::RunCompleted {
                summary: "done".to_string(),
            },
        )
        .await
        .unwrap();

        let result = log.append(run.id, delegated(0)).await;
        assert!(matches!(result.unwrap_err(), AppError::RunTerminated(_)));

        // No event leaked past the terminal one.
        let events = log.read(run.id, 1).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_append_invalid_transition() {
        let log = setup_log().await;
        let run = log
            .create_run("ws-1", "user-1", "sample", false)
            .await
            .unwrap();

        // task.delegated is not valid before run.started
        let result = log.append(run.id, delegated(0)).await;
        assert!(matches!(
            result.unwrap_err(),
            AppError::InvalidTransition(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_appends_stay_contiguous() {
        let log = setup_log().await;
        let run = log
            .create_run("ws-1", "user-1", "sample", false)
            .await
            .unwrap();
        log.append(run.id, started("sample")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let log = log.clone();
            let run_id = run.id;
            handles.push(tokio::spawn(async move {
                log.append(run_id, delegated(i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let events = log.read(run.id, 1).await.unwrap();
        assert_eq!(events.len(), 9);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as i64 + 1);
        }
    }

    #[tokio::test]
    async fn test_read_is_restartable() {
        let log = setup_log().await;
        let run = log
            .create_run("ws-1", "user-1", "sample", false)
            .await
            .unwrap();

        log.append(run.id, started("sample")).await.unwrap();
        log.append(run.id, delegated(0)).await.unwrap();
        log.append(
            run.id,
            EventPayload::TaskCompleted {
                subtask: 0,
                specialist_id: "spec-1".to_string(),
                outcome: TaskOutcome::Success,
                output: "ok".to_string(),
            },
        )
        .await
        .unwrap();

        let tail = log.read(run.id, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 2);

        let later = log.read(run.id, 3).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].seq, 3);
    }

    #[tokio::test]
    async fn test_read_unknown_run() {
        let log = setup_log().await;
        let result = log.read(Uuid::new_v4(), 1).await;
        assert!(matches!(result.unwrap_err(), AppError::UnknownRun(_)));
    }

    #[tokio::test]
    async fn test_find_active() {
        let log = setup_log().await;
        assert!(log.find_active("ws-1", "sample").await.unwrap().is_none());

        let run = log
            .create_run("ws-1", "user-1", "sample", false)
            .await
            .unwrap();
        let found = log.find_active("ws-1", "sample").await.unwrap().unwrap();
        assert_eq!(found.id, run.id);

        log.append(run.id, started("sample")).await.unwrap();
        log.append(
            run.id,
            EventPayload::RunCompleted {
                summary: "done".to_string(),
            },
        )
        .await
        .unwrap();

        // Terminal runs are not resumable.
        assert!(log.find_active("ws-1", "sample").await.unwrap().is_none());
    }
}
