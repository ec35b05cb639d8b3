//! Companion memory store
//!
//! Deterministic retrieval contract: a match scores one point per query token
//! contained in its content, ties break by memory id ascending, top-k wins.
//! Ranking beyond that is out of scope.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::Result;

/// A retrieved memory with its overlap score
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryMatch {
    pub memory_id: String,
    pub score: u32,
    pub content: String,
}

/// Store over the memory table
#[derive(Clone)]
pub struct MemoryStore {
    pool: SqlitePool,
}

impl MemoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(
        &self,
        workspace_id: &str,
        agent_id: &str,
        memory_id: &str,
        content: &str,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO memories (workspace_id, agent_id, memory_id, content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(workspace_id, agent_id, memory_id) DO UPDATE SET
                content = excluded.content,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(workspace_id)
        .bind(agent_id)
        .bind(memory_id)
        .bind(content)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn search(
        &self,
        workspace_id: &str,
        agent_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<MemoryMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT memory_id, content
            FROM memories
            WHERE workspace_id = ? AND agent_id = ?
            "#,
        )
        .bind(workspace_id)
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        let tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|t| t.to_string())
            .collect();

        let mut matches: Vec<MemoryMatch> = rows
            .into_iter()
            .filter_map(|(memory_id, content)| {
                let haystack = content.to_lowercase();
                let score = tokens.iter().filter(|t| haystack.contains(*t)).count() as u32;
                if score == 0 && !tokens.is_empty() {
                    return None;
                }
                Some(MemoryMatch {
                    memory_id,
                    score,
                    content,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.memory_id.cmp(&b.memory_id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> MemoryStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        MemoryStore::new(pool)
    }

    #[tokio::test]
    async fn test_upsert_and_search() {
        let store = setup_store().await;
        store
            .upsert("ws-1", "companion_primary", "m-1", "rust event sourcing notes")
            .await
            .unwrap();
        store
            .upsert("ws-1", "companion_primary", "m-2", "grocery list")
            .await
            .unwrap();

        let matches = store
            .search("ws-1", "companion_primary", "event sourcing", 5)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].memory_id, "m-1");
        assert_eq!(matches[0].score, 2);
    }

    #[tokio::test]
    async fn test_search_orders_by_score_then_id() {
        let store = setup_store().await;
        store
            .upsert("ws-1", "agent", "m-b", "alpha beta")
            .await
            .unwrap();
        store
            .upsert("ws-1", "agent", "m-a", "alpha beta")
            .await
            .unwrap();
        store.upsert("ws-1", "agent", "m-c", "alpha").await.unwrap();

        let matches = store.search("ws-1", "agent", "alpha beta", 5).await.unwrap();
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].memory_id, "m-a");
        assert_eq!(matches[1].memory_id, "m-b");
        assert_eq!(matches[2].memory_id, "m-c");
    }

    #[tokio::test]
    async fn test_search_respects_top_k() {
        let store = setup_store().await;
        for i in 0..5 {
            store
                .upsert("ws-1", "agent", &format!("m-{}", i), "shared topic")
                .await
                .unwrap();
        }

        let matches = store.search("ws-1", "agent", "topic", 3).await.unwrap();
        assert_eq!(matches.len(), 3);

        let none = store.search("ws-1", "agent", "topic", 0).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_search_is_workspace_and_agent_scoped() {
        let store = setup_store().await;
        store
            .upsert("ws-1", "agent-a", "m-1", "topic")
            .await
            .unwrap();
        store
            .upsert("ws-2", "agent-a", "m-2", "topic")
            .await
            .unwrap();
        store
            .upsert("ws-1", "agent-b", "m-3", "topic")
            .await
            .unwrap();

        let matches = store.search("ws-1", "agent-a", "topic", 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].memory_id, "m-1");
    }

    #[tokio::test]
    async fn test_upsert_replaces_content() {
        let store = setup_store().await;
        store.upsert("ws-1", "agent", "m-1", "old").await.unwrap();
        store.upsert("ws-1", "agent", "m-1", "new topic").await.unwrap();

        let matches = store.search("ws-1", "agent", "topic", 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].content, "new topic");
    }
}
