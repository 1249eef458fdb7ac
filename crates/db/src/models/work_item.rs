use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkItemError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("work item not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "work_item_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum WorkItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemStatus::Completed | WorkItemStatus::Failed)
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::InProgress => "in_progress",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        };
        write!(f, "{}", s)
    }
}

/// A unit of deliverable work produced by planning. `attempts` counts
/// write/verify rounds, including the one that settled the item.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TS)]
#[ts(export)]
pub struct WorkItem {
    pub id: Uuid,
    pub run_id: Uuid,
    pub title: String,
    pub description: String,
    pub agent: String,
    pub status: WorkItemStatus,
    pub priority: Priority,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub position: i64,
    pub external_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CreateWorkItem {
    pub run_id: Uuid,
    pub title: String,
    pub description: String,
    pub agent: String,
    pub priority: Priority,
    pub position: i64,
}

impl WorkItem {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateWorkItem,
        id: Uuid,
    ) -> Result<Self, WorkItemError> {
        Ok(sqlx::query_as::<_, WorkItem>(
            r#"INSERT INTO work_items (id, run_id, title, description, agent, priority, position)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
               RETURNING *"#,
        )
        .bind(id)
        .bind(data.run_id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(&data.agent)
        .bind(data.priority)
        .bind(data.position)
        .fetch_one(pool)
        .await?)
    }

    /// Insert a planning batch atomically so a crashed planner never
    /// leaves a half-written item list behind.
    pub async fn create_batch(
        pool: &SqlitePool,
        items: &[CreateWorkItem],
    ) -> Result<Vec<Self>, WorkItemError> {
        let mut tx = pool.begin().await?;
        let mut created = Vec::with_capacity(items.len());
        for item in items {
            let row = sqlx::query_as::<_, WorkItem>(
                r#"INSERT INTO work_items (id, run_id, title, description, agent, priority, position)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                   RETURNING *"#,
            )
            .bind(Uuid::new_v4())
            .bind(item.run_id)
            .bind(&item.title)
            .bind(&item.description)
            .bind(&item.agent)
            .bind(item.priority)
            .bind(item.position)
            .fetch_one(&mut *tx)
            .await?;
            created.push(row);
        }
        tx.commit().await?;
        Ok(created)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, WorkItemError> {
        Ok(
            sqlx::query_as::<_, WorkItem>(r#"SELECT * FROM work_items WHERE id = ?1"#)
                .bind(id)
                .fetch_optional(pool)
                .await?,
        )
    }

    pub async fn find_by_run(pool: &SqlitePool, run_id: Uuid) -> Result<Vec<Self>, WorkItemError> {
        Ok(sqlx::query_as::<_, WorkItem>(
            r#"SELECT * FROM work_items
               WHERE run_id = ?1
               ORDER BY position ASC, created_at ASC"#,
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?)
    }

    /// Items a resumed driver still has to settle.
    pub async fn find_unfinished(
        pool: &SqlitePool,
        run_id: Uuid,
    ) -> Result<Vec<Self>, WorkItemError> {
        Ok(sqlx::query_as::<_, WorkItem>(
            r#"SELECT * FROM work_items
               WHERE run_id = ?1 AND status IN ('pending', 'in_progress')
               ORDER BY position ASC, created_at ASC"#,
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?)
    }

    pub async fn start(pool: &SqlitePool, id: Uuid) -> Result<Self, WorkItemError> {
        sqlx::query_as::<_, WorkItem>(
            r#"UPDATE work_items
               SET status = 'in_progress',
                   updated_at = datetime('now', 'subsec')
               WHERE id = ?1
               RETURNING *"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(WorkItemError::NotFound)
    }

    /// Persist the outcome of a failed write/verify round so a resumed
    /// driver keeps counting from where the previous one stopped.
    pub async fn record_attempt(
        pool: &SqlitePool,
        id: Uuid,
        attempts: i64,
        last_error: &str,
    ) -> Result<Self, WorkItemError> {
        sqlx::query_as::<_, WorkItem>(
            r#"UPDATE work_items
               SET attempts = ?2,
                   last_error = ?3,
                   updated_at = datetime('now', 'subsec')
               WHERE id = ?1
               RETURNING *"#,
        )
        .bind(id)
        .bind(attempts)
        .bind(last_error)
        .fetch_optional(pool)
        .await?
        .ok_or(WorkItemError::NotFound)
    }

    pub async fn complete(
        pool: &SqlitePool,
        id: Uuid,
        attempts: i64,
    ) -> Result<Self, WorkItemError> {
        sqlx::query_as::<_, WorkItem>(
            r#"UPDATE work_items
               SET status = 'completed',
                   attempts = ?2,
                   last_error = NULL,
                   updated_at = datetime('now', 'subsec')
               WHERE id = ?1
               RETURNING *"#,
        )
        .bind(id)
        .bind(attempts)
        .fetch_optional(pool)
        .await?
        .ok_or(WorkItemError::NotFound)
    }

    pub async fn fail(
        pool: &SqlitePool,
        id: Uuid,
        attempts: i64,
        error: &str,
    ) -> Result<Self, WorkItemError> {
        sqlx::query_as::<_, WorkItem>(
            r#"UPDATE work_items
               SET status = 'failed',
                   attempts = ?2,
                   last_error = ?3,
                   updated_at = datetime('now', 'subsec')
               WHERE id = ?1
               RETURNING *"#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .fetch_optional(pool)
        .await?
        .ok_or(WorkItemError::NotFound)
    }

    pub async fn set_external_ref(
        pool: &SqlitePool,
        id: Uuid,
        external_ref: &str,
    ) -> Result<Self, WorkItemError> {
        sqlx::query_as::<_, WorkItem>(
            r#"UPDATE work_items
               SET external_ref = ?2,
                   updated_at = datetime('now', 'subsec')
               WHERE id = ?1
               RETURNING *"#,
        )
        .bind(id)
        .bind(external_ref)
        .fetch_optional(pool)
        .await?
        .ok_or(WorkItemError::NotFound)
    }

    pub async fn count_by_status(
        pool: &SqlitePool,
        run_id: Uuid,
        status: WorkItemStatus,
    ) -> Result<i64, WorkItemError> {
        Ok(sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM work_items WHERE run_id = ?1 AND status = ?2"#,
        )
        .bind(run_id)
        .bind(status)
        .fetch_one(pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        run::{CreateRun, Run},
        test_utils::setup_test_pool,
    };

    async fn make_run(pool: &SqlitePool) -> Run {
        Run::create(
            pool,
            &CreateRun {
                project_name: "todo-api".to_string(),
                description: String::new(),
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap()
    }

    fn item(run_id: Uuid, title: &str, position: i64) -> CreateWorkItem {
        CreateWorkItem {
            run_id,
            title: title.to_string(),
            description: format!("build {}", title),
            agent: "mason".to_string(),
            priority: Priority::Medium,
            position,
        }
    }

    #[tokio::test]
    async fn batch_insert_preserves_position_order() {
        let pool = setup_test_pool().await;
        let run = make_run(&pool).await;

        let created = WorkItem::create_batch(
            &pool,
            &[
                item(run.id, "auth", 0),
                item(run.id, "models", 1),
                item(run.id, "endpoints", 2),
            ],
        )
        .await
        .unwrap();
        assert_eq!(created.len(), 3);

        let found = WorkItem::find_by_run(&pool, run.id).await.unwrap();
        let titles: Vec<&str> = found.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["auth", "models", "endpoints"]);
        assert!(found.iter().all(|i| i.status == WorkItemStatus::Pending));
        assert!(found.iter().all(|i| i.attempts == 0));
    }

    #[tokio::test]
    async fn lifecycle_to_completed() {
        let pool = setup_test_pool().await;
        let run = make_run(&pool).await;
        let created = WorkItem::create(&pool, &item(run.id, "auth", 0), Uuid::new_v4())
            .await
            .unwrap();

        let started = WorkItem::start(&pool, created.id).await.unwrap();
        assert_eq!(started.status, WorkItemStatus::InProgress);

        let tried = WorkItem::record_attempt(&pool, created.id, 1, "verification feedback")
            .await
            .unwrap();
        assert_eq!(tried.attempts, 1);
        assert_eq!(tried.last_error.as_deref(), Some("verification feedback"));

        let done = WorkItem::complete(&pool, created.id, 2).await.unwrap();
        assert_eq!(done.status, WorkItemStatus::Completed);
        assert_eq!(done.attempts, 2);
        assert!(done.last_error.is_none());
    }

    #[tokio::test]
    async fn failed_items_keep_their_error() {
        let pool = setup_test_pool().await;
        let run = make_run(&pool).await;
        let created = WorkItem::create(&pool, &item(run.id, "auth", 0), Uuid::new_v4())
            .await
            .unwrap();

        let failed = WorkItem::fail(&pool, created.id, 5, "verification never passed")
            .await
            .unwrap();
        assert_eq!(failed.status, WorkItemStatus::Failed);
        assert_eq!(failed.attempts, 5);
        assert_eq!(
            failed.last_error.as_deref(),
            Some("verification never passed")
        );

        let n = WorkItem::count_by_status(&pool, run.id, WorkItemStatus::Failed)
            .await
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn unfinished_excludes_settled_items() {
        let pool = setup_test_pool().await;
        let run = make_run(&pool).await;
        let created = WorkItem::create_batch(
            &pool,
            &[item(run.id, "auth", 0), item(run.id, "models", 1)],
        )
        .await
        .unwrap();

        WorkItem::complete(&pool, created[0].id, 1).await.unwrap();

        let unfinished = WorkItem::find_unfinished(&pool, run.id).await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].title, "models");
    }

    #[tokio::test]
    async fn external_ref_round_trips() {
        let pool = setup_test_pool().await;
        let run = make_run(&pool).await;
        let created = WorkItem::create(&pool, &item(run.id, "auth", 0), Uuid::new_v4())
            .await
            .unwrap();

        let updated = WorkItem::set_external_ref(&pool, created.id, "TRACK-42")
            .await
            .unwrap();
        assert_eq!(updated.external_ref.as_deref(), Some("TRACK-42"));
    }
}
