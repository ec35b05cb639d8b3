//! Hash-chained, tamper-evident audit ledger
//!
//! Every state-changing action lands here, workspace-scoped and totally
//! ordered by an explicit position. Each entry binds to its predecessor via
//! `event_hash = SHA-256(previous_hash || canonical(action, outcome,
//! metadata, actor_id, created_at))`; the first entry chains off an all-zero
//! genesis hash. Writers are serialized per workspace so no entry is hashed
//! against a stale predecessor.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::AuditEvent;

/// Previous hash of the first entry in every workspace chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Result of a chain verification pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainReport {
    pub workspace_id: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<Uuid>,
}

/// Workspace-scoped audit chain over the ledger table
#[derive(Clone)]
pub struct AuditChain {
    pool: SqlitePool,
    workspace_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AuditChain {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            workspace_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn workspace_lock(&self, workspace_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.workspace_locks.lock().await;
        locks
            .entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append one ledger entry, chaining it to the workspace's latest hash.
    pub async fn record(
        &self,
        workspace_id: &str,
        actor_id: &str,
        action: &str,
        outcome: &str,
        metadata: serde_json::Value,
    ) -> Result<AuditEvent> {
        let lock = self.workspace_lock(workspace_id).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        let tip: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT position, event_hash
            FROM audit_events
            WHERE workspace_id = ?
            ORDER BY position DESC
            LIMIT 1
            "#,
        )
        .bind(workspace_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (position, previous_hash) = match tip {
            Some((position, hash)) => (position + 1, hash),
            None => (1, GENESIS_HASH.to_string()),
        };

        let id = Uuid::new_v4();
        let created_at = Utc::now().to_rfc3339();
        let event_hash = chain_hash(
            &previous_hash,
            &entry_canonical(action, outcome, &metadata, actor_id, &created_at),
        );
        let metadata_json = metadata.to_string();

        sqlx::query(
            r#"
            INSERT INTO audit_events (id, workspace_id, position, actor_id, action, outcome, metadata, previous_hash, event_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(workspace_id)
        .bind(position)
        .bind(actor_id)
        .bind(action)
        .bind(outcome)
        .bind(&metadata_json)
        .bind(&previous_hash)
        .bind(&event_hash)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AuditEvent {
            id,
            workspace_id: workspace_id.to_string(),
            position,
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            outcome: outcome.to_string(),
            metadata,
            previous_hash,
            event_hash,
            created_at,
        })
    }

    /// Recompute the chain from genesis. Reports the first entry whose
    /// linkage or recomputed hash does not match; history is never repaired.
    pub async fn verify(&self, workspace_id: &str) -> Result<ChainReport> {
        let events = self.list(workspace_id, i64::MAX).await?;

        let mut previous_hash = GENESIS_HASH.to_string();
        for event in &events {
            let computed = chain_hash(
                &previous_hash,
                &entry_canonical(
                    &event.action,
                    &event.outcome,
                    &event.metadata,
                    &event.actor_id,
                    &event.created_at,
                ),
            );
            if event.previous_hash != previous_hash || event.event_hash != computed {
                tracing::warn!(
                    workspace_id,
                    event_id = %event.id,
                    position = event.position,
                    "audit chain verification failed"
                );
                return Ok(ChainReport {
                    workspace_id: workspace_id.to_string(),
                    valid: false,
                    broken_at: Some(event.id),
                });
            }
            previous_hash = event.event_hash.clone();
        }

        Ok(ChainReport {
            workspace_id: workspace_id.to_string(),
            valid: true,
            broken_at: None,
        })
    }

    /// Verification as a hard failure, for callers that must not proceed
    /// over a broken chain.
    pub async fn require_intact(&self, workspace_id: &str) -> Result<()> {
        let report = self.verify(workspace_id).await?;
        match report.broken_at {
            Some(event_id) => Err(AppError::ChainMismatch {
                workspace_id: workspace_id.to_string(),
                event_id,
            }),
            None => Ok(()),
        }
    }

    pub async fn list(&self, workspace_id: &str, limit: i64) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, workspace_id, position, actor_id, action, outcome, metadata, previous_hash, event_hash, created_at
            FROM audit_events
            WHERE workspace_id = ?
            ORDER BY position ASC
            LIMIT ?
            "#,
        )
        .bind(workspace_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

/// Canonical serialization of the hashed entry fields: a JSON object with
/// recursively sorted keys, so the bytes are stable regardless of how the
/// metadata map was built.
fn entry_canonical(
    action: &str,
    outcome: &str,
    metadata: &serde_json::Value,
    actor_id: &str,
    created_at: &str,
) -> String {
    let entry = serde_json::json!({
        "action": action,
        "actor_id": actor_id,
        "created_at": created_at,
        "metadata": metadata,
        "outcome": outcome,
    });
    canonical_json(&entry)
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(key.clone()),
                        canonical_json(&map[key])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let elements: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", elements.join(","))
        }
        other => other.to_string(),
    }
}

fn chain_hash(previous_hash: &str, canonical: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", previous_hash, canonical).as_bytes());
    format!("{:x}", digest)
}

// Internal row type for sqlx

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: String,
    workspace_id: String,
    position: i64,
    actor_id: String,
    action: String,
    outcome: String,
    metadata: String,
    previous_hash: String,
    event_hash: String,
    created_at: String,
}

impl TryFrom<AuditRow> for AuditEvent {
    type Error = AppError;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(AuditEvent {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| AppError::Internal(format!("Invalid audit UUID: {}", e)))?,
            workspace_id: row.workspace_id,
            position: row.position,
            actor_id: row.actor_id,
            action: row.action,
            outcome: row.outcome,
            metadata: serde_json::from_str(&row.metadata)
                .map_err(|e| AppError::Internal(format!("Invalid audit metadata: {}", e)))?,
            previous_hash: row.previous_hash,
            event_hash: row.event_hash,
            created_at: row.created_at,
        })
    }
}
