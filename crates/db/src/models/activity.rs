use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "activity_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ActivityStatus {
    Started,
    Completed,
    Failed,
    Retrying,
    Warning,
    PartialFailure,
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityStatus::Started => "started",
            ActivityStatus::Completed => "completed",
            ActivityStatus::Failed => "failed",
            ActivityStatus::Retrying => "retrying",
            ActivityStatus::Warning => "warning",
            ActivityStatus::PartialFailure => "partial_failure",
        };
        write!(f, "{}", s)
    }
}

/// Append-only audit trail of what each agent did during a run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TS)]
#[ts(export)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub work_item_id: Option<Uuid>,
    pub agent: String,
    pub action: String,
    pub status: ActivityStatus,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CreateActivity {
    pub run_id: Uuid,
    pub work_item_id: Option<Uuid>,
    pub agent: String,
    pub action: String,
    pub status: ActivityStatus,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

impl ActivityRecord {
    pub async fn create(pool: &SqlitePool, data: &CreateActivity) -> Result<Self, ActivityError> {
        Ok(sqlx::query_as::<_, ActivityRecord>(
            r#"INSERT INTO activity_records (id, run_id, work_item_id, agent, action, status, error, duration_ms)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(data.run_id)
        .bind(data.work_item_id)
        .bind(&data.agent)
        .bind(&data.action)
        .bind(data.status)
        .bind(&data.error)
        .bind(data.duration_ms)
        .fetch_one(pool)
        .await?)
    }

    /// Records in insertion order; rowid breaks same-millisecond ties.
    pub async fn find_by_run(
        pool: &SqlitePool,
        run_id: Uuid,
    ) -> Result<Vec<Self>, ActivityError> {
        Ok(sqlx::query_as::<_, ActivityRecord>(
            r#"SELECT * FROM activity_records
               WHERE run_id = ?1
               ORDER BY created_at ASC, rowid ASC"#,
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?)
    }

    pub async fn count_by_status(
        pool: &SqlitePool,
        run_id: Uuid,
        status: ActivityStatus,
    ) -> Result<i64, ActivityError> {
        Ok(sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM activity_records WHERE run_id = ?1 AND status = ?2"#,
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

    fn record(run_id: Uuid, agent: &str, action: &str, status: ActivityStatus) -> CreateActivity {
        CreateActivity {
            run_id,
            work_item_id: None,
            agent: agent.to_string(),
            action: action.to_string(),
            status,
            error: None,
            duration_ms: None,
        }
    }

    #[tokio::test]
    async fn records_come_back_in_insertion_order() {
        let pool = setup_test_pool().await;
        let run = make_run(&pool).await;

        for action in ["requirements", "decompose", "register_tracking"] {
            ActivityRecord::create(&pool, &record(run.id, "scribe", action, ActivityStatus::Completed))
                .await
                .unwrap();
        }

        let records = ActivityRecord::find_by_run(&pool, run.id).await.unwrap();
        let actions: Vec<&str> = records.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(actions, vec!["requirements", "decompose", "register_tracking"]);
    }

    #[tokio::test]
    async fn count_by_status_filters() {
        let pool = setup_test_pool().await;
        let run = make_run(&pool).await;

        ActivityRecord::create(&pool, &record(run.id, "vista", "diagram", ActivityStatus::PartialFailure))
            .await
            .unwrap();
        ActivityRecord::create(&pool, &record(run.id, "docent", "manual", ActivityStatus::PartialFailure))
            .await
            .unwrap();
        ActivityRecord::create(&pool, &record(run.id, "tally", "report", ActivityStatus::Completed))
            .await
            .unwrap();

        let n = ActivityRecord::count_by_status(&pool, run.id, ActivityStatus::PartialFailure)
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn error_and_duration_round_trip() {
        let pool = setup_test_pool().await;
        let run = make_run(&pool).await;

        let created = ActivityRecord::create(
            &pool,
            &CreateActivity {
                run_id: run.id,
                work_item_id: None,
                agent: "mason".to_string(),
                action: "write".to_string(),
                status: ActivityStatus::Failed,
                error: Some("generation backend unavailable".to_string()),
                duration_ms: Some(840),
            },
        )
        .await
        .unwrap();

        assert_eq!(
            created.error.as_deref(),
            Some("generation backend unavailable")
        );
        assert_eq!(created.duration_ms, Some(840));
    }
}
