//! Workspace directory: owner/member records and the access check
//!
//! Workspaces are provisioned externally; here the first owner to touch a
//! workspace id claims it, after which access is strictly by ownership or a
//! membership row. Rename is the only workspace mutation.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::{AppError, Result};
use crate::models::{ActorContext, Role, Workspace, WorkspaceMember};

/// Directory over the workspace and membership tables
#[derive(Clone)]
pub struct WorkspaceDirectory {
    pool: SqlitePool,
}

impl WorkspaceDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, workspace_id: &str) -> Result<Workspace> {
        let row = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT id, name, owner_id, created_at FROM workspaces WHERE id = ?",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Workspace {} not found", workspace_id)))?;

        Ok(row.into())
    }

    /// Authorize an actor for a workspace, provisioning it on first owner
    /// access. Members must hold a membership row.
    pub async fn ensure_access(&self, workspace_id: &str, actor: &ActorContext) -> Result<()> {
        let workspace = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT id, name, owner_id, created_at FROM workspaces WHERE id = ?",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        match workspace {
            None => {
                if actor.role == Role::Owner {
                    sqlx::query(
                        "INSERT INTO workspaces (id, name, owner_id, created_at) VALUES (?, ?, ?, ?)",
                    )
                    .bind(workspace_id)
                    .bind(workspace_id)
                    .bind(&actor.user_id)
                    .bind(Utc::now())
                    .execute(&self.pool)
                    .await?;
                    return Ok(());
                }
                if self.is_member(workspace_id, &actor.user_id).await? {
                    return Ok(());
                }
                Err(AppError::Forbidden(
                    "actor is not authorized for this workspace".to_string(),
                ))
            }
            Some(workspace) => match actor.role {
                Role::Owner => {
                    if actor.user_id == workspace.owner_id {
                        Ok(())
                    } else {
                        Err(AppError::Forbidden(
                            "actor is not authorized for this workspace".to_string(),
                        ))
                    }
                }
                Role::Member => {
                    if self.is_member(workspace_id, &actor.user_id).await? {
                        Ok(())
                    } else {
                        Err(AppError::Forbidden(
                            "actor is not authorized for this workspace".to_string(),
                        ))
                    }
                }
            },
        }
    }

    async fn is_member(&self, workspace_id: &str, user_id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM workspace_members WHERE workspace_id = ? AND user_id = ?",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn add_member(&self, workspace_id: &str, user_id: &str) -> Result<WorkspaceMember> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO workspace_members (workspace_id, user_id, role, added_at)
            VALUES (?, ?, 'member', ?)
            ON CONFLICT(workspace_id, user_id) DO NOTHING
            "#,
        )
        .bind(workspace_id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(WorkspaceMember {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            role: Role::Member,
            added_at: now,
        })
    }

    pub async fn list_members(&self, workspace_id: &str) -> Result<Vec<WorkspaceMember>> {
        let rows = sqlx::query_as::<_, MemberRow>(
            r#"
            SELECT workspace_id, user_id, role, added_at
            FROM workspace_members
            WHERE workspace_id = ?
            ORDER BY added_at ASC
            "#,
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    pub async fn rename(&self, workspace_id: &str, name: &str) -> Result<Workspace> {
        let updated = sqlx::query("UPDATE workspaces SET name = ? WHERE id = ?")
            .bind(name)
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Workspace {} not found",
                workspace_id
            )));
        }
        self.get(workspace_id).await
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    name: String,
    owner_id: String,
    created_at: DateTime<Utc>,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Workspace {
            id: row.id,
            name: row.name,
            owner_id: row.owner_id,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MemberRow {
    workspace_id: String,
    user_id: String,
    role: String,
    added_at: DateTime<Utc>,
}

impl TryFrom<MemberRow> for WorkspaceMember {
    type Error = AppError;

    fn try_from(row: MemberRow) -> Result<Self> {
        Ok(WorkspaceMember {
            workspace_id: row.workspace_id,
            user_id: row.user_id,
            role: row
                .role
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid role: {}", e)))?,
            added_at: row.added_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_directory() -> WorkspaceDirectory {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        WorkspaceDirectory::new(pool)
    }

    fn owner(user_id: &str) -> ActorContext {
        ActorContext::new(user_id, Role::Owner)
    }

    fn member(user_id: &str) -> ActorContext {
        ActorContext::new(user_id, Role::Member)
    }

    #[tokio::test]
    async fn test_first_owner_access_provisions_workspace() {
        let directory = setup_directory().await;
        directory.ensure_access("ws-1", &owner("alice")).await.unwrap();

        let workspace = directory.get("ws-1").await.unwrap();
        assert_eq!(workspace.owner_id, "alice");
    }

    #[tokio::test]
    async fn test_second_owner_is_rejected() {
        let directory = setup_directory().await;
        directory.ensure_access("ws-1", &owner("alice")).await.unwrap();

        let result = directory.ensure_access("ws-1", &owner("mallory")).await;
        assert!(matches!(result.unwrap_err(), AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_member_needs_membership_row() {
        let directory = setup_directory().await;
        directory.ensure_access("ws-1", &owner("alice")).await.unwrap();

        let result = directory.ensure_access("ws-1", &member("bob")).await;
        assert!(matches!(result.unwrap_err(), AppError::Forbidden(_)));

        directory.add_member("ws-1", "bob").await.unwrap();
        directory.ensure_access("ws-1", &member("bob")).await.unwrap();
    }

    #[tokio::test]
    async fn test_member_rejected_on_unprovisioned_workspace() {
        let directory = setup_directory().await;
        let result = directory.ensure_access("ws-ghost", &member("bob")).await;
        assert!(matches!(result.unwrap_err(), AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_add_member_is_idempotent() {
        let directory = setup_directory().await;
        directory.ensure_access("ws-1", &owner("alice")).await.unwrap();

        directory.add_member("ws-1", "bob").await.unwrap();
        directory.add_member("ws-1", "bob").await.unwrap();

        let members = directory.list_members("ws-1").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, "bob");
        assert_eq!(members[0].role, Role::Member);
    }

    #[tokio::test]
    async fn test_rename() {
        let directory = setup_directory().await;
        directory.ensure_access("ws-1", &owner("alice")).await.unwrap();

        let renamed = directory.rename("ws-1", "Research Workspace").await.unwrap();
        assert_eq!(renamed.name, "Research Workspace");
    }

    #[tokio::test]
    async fn test_rename_unknown_workspace() {
        let directory = setup_directory().await;
        let result = directory.rename("ws-ghost", "Nope").await;
        assert!(matches!(result.unwrap_err(), AppError::NotFound(_)));
    }
}
