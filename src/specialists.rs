//! Specialist agent registry
//!
//! Delegation targets registered per workspace. Identity is immutable once
//! created; name, prompt, soul and capabilities are owner-mutable in place.
//! `position` preserves registration order for subtask planning.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::{AppError, Result};
use crate::models::{Capability, SpecialistAgent};

/// Fields a caller supplies when creating or editing a specialist
#[derive(Debug, Clone)]
pub struct SpecialistDraft {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub soul: String,
    pub capabilities: Vec<Capability>,
}

/// Registry over the specialist table
#[derive(Clone)]
pub struct SpecialistRegistry {
    pool: SqlitePool,
}

impl SpecialistRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a specialist. A new specialist takes the next
    /// registration position; an existing one keeps its position and
    /// created_at.
    pub async fn upsert(
        &self,
        workspace_id: &str,
        draft: SpecialistDraft,
    ) -> Result<SpecialistAgent> {
        let existing_position: Option<(i64,)> = sqlx::query_as(
            "SELECT position FROM specialists WHERE workspace_id = ? AND id = ?",
        )
        .bind(workspace_id)
        .bind(&draft.id)
        .fetch_optional(&self.pool)
        .await?;

        let position = match existing_position {
            Some((position,)) => position,
            None => {
                let (max,): (i64,) = sqlx::query_as(
                    "SELECT COALESCE(MAX(position), 0) FROM specialists WHERE workspace_id = ?",
                )
                .bind(workspace_id)
                .fetch_one(&self.pool)
                .await?;
                max + 1
            }
        };

        let capabilities_json = serde_json::to_string(&draft.capabilities)
            .map_err(|e| AppError::Internal(format!("Failed to serialize capabilities: {}", e)))?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO specialists (workspace_id, id, name, prompt, soul, capabilities, position, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(workspace_id, id) DO UPDATE SET
                name = excluded.name,
                prompt = excluded.prompt,
                soul = excluded.soul,
                capabilities = excluded.capabilities,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(workspace_id)
        .bind(&draft.id)
        .bind(&draft.name)
        .bind(&draft.prompt)
        .bind(&draft.soul)
        .bind(&capabilities_json)
        .bind(position)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(workspace_id, &draft.id).await
    }

    pub async fn get(&self, workspace_id: &str, id: &str) -> Result<SpecialistAgent> {
        let row = sqlx::query_as::<_, SpecialistRow>(
            r#"
            SELECT workspace_id, id, name, prompt, soul, capabilities, position, created_at, updated_at
            FROM specialists
            WHERE workspace_id = ? AND id = ?
            "#,
        )
        .bind(workspace_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Specialist {} not found", id)))?;

        row.try_into()
    }

    /// All specialists in registration order, ties broken by id ascending.
    pub async fn list(&self, workspace_id: &str) -> Result<Vec<SpecialistAgent>> {
        let rows = sqlx::query_as::<_, SpecialistRow>(
            r#"
            SELECT workspace_id, id, name, prompt, soul, capabilities, position, created_at, updated_at
            FROM specialists
            WHERE workspace_id = ?
            ORDER BY position ASC, id ASC
            "#,
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

// Internal row type for sqlx

#[derive(sqlx::FromRow)]
struct SpecialistRow {
    workspace_id: String,
    id: String,
    name: String,
    prompt: String,
    soul: String,
    capabilities: String,
    position: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SpecialistRow> for SpecialistAgent {
    type Error = AppError;

    fn try_from(row: SpecialistRow) -> Result<Self> {
        Ok(SpecialistAgent {
            id: row.id,
            workspace_id: row.workspace_id,
            name: row.name,
            prompt: row.prompt,
            soul: row.soul,
            capabilities: serde_json::from_str(&row.capabilities)
                .map_err(|e| AppError::Internal(format!("Invalid capability set: {}", e)))?,
            position: row.position,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
