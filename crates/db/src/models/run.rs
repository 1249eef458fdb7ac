use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("run not found")]
    NotFound,
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

/// Position of a run in the stage graph. `Complete` means the graph has
/// been fully traversed; whether that ended well is carried by [`RunStatus`].
#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "run_stage", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum RunStage {
    Planning,
    BuildVerify,
    ArtifactFanout,
    Complete,
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStage::Planning => "planning",
            RunStage::BuildVerify => "build_verify",
            RunStage::ArtifactFanout => "artifact_fanout",
            RunStage::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum RunStatus {
    Planning,
    Executing,
    Ready,
    Failed,
    Archived,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Ready | RunStatus::Failed | RunStatus::Archived)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Planning => "planning",
            RunStatus::Executing => "executing",
            RunStatus::Ready => "ready",
            RunStatus::Failed => "failed",
            RunStatus::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TS)]
#[ts(export)]
pub struct Run {
    pub id: Uuid,
    pub project_name: String,
    pub description: String,
    pub stage: RunStage,
    pub status: RunStatus,
    pub failed_items: i64,
    pub error: Option<String>,
    pub planning_completed_at: Option<DateTime<Utc>>,
    pub build_verify_completed_at: Option<DateTime<Utc>>,
    pub fanout_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CreateRun {
    pub project_name: String,
    #[serde(default)]
    pub description: String,
}

impl Run {
    pub async fn create(pool: &SqlitePool, data: &CreateRun, id: Uuid) -> Result<Self, RunError> {
        Ok(sqlx::query_as::<_, Run>(
            r#"INSERT INTO runs (id, project_name, description)
               VALUES (?1, ?2, ?3)
               RETURNING *"#,
        )
        .bind(id)
        .bind(&data.project_name)
        .bind(&data.description)
        .fetch_one(pool)
        .await?)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, RunError> {
        Ok(
            sqlx::query_as::<_, Run>(r#"SELECT * FROM runs WHERE id = ?1"#)
                .bind(id)
                .fetch_optional(pool)
                .await?,
        )
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<Self>, RunError> {
        Ok(
            sqlx::query_as::<_, Run>(r#"SELECT * FROM runs ORDER BY created_at DESC"#)
                .fetch_all(pool)
                .await?,
        )
    }

    /// Runs whose driver should be live: anything not yet terminal.
    pub async fn find_active(pool: &SqlitePool) -> Result<Vec<Self>, RunError> {
        Ok(sqlx::query_as::<_, Run>(
            r#"SELECT * FROM runs
               WHERE status IN ('planning', 'executing')
               ORDER BY created_at ASC"#,
        )
        .fetch_all(pool)
        .await?)
    }

    /// Persist the mutable fields of a run by primary key. Writing the
    /// same snapshot twice leaves the row in the same state, so retrying
    /// callers are safe.
    pub async fn save_snapshot(pool: &SqlitePool, run: &Run) -> Result<Self, RunError> {
        sqlx::query_as::<_, Run>(
            r#"UPDATE runs
               SET stage = ?2,
                   status = ?3,
                   failed_items = ?4,
                   error = ?5,
                   updated_at = datetime('now', 'subsec')
               WHERE id = ?1
               RETURNING *"#,
        )
        .bind(run.id)
        .bind(run.stage)
        .bind(run.status)
        .bind(run.failed_items)
        .bind(&run.error)
        .fetch_optional(pool)
        .await?
        .ok_or(RunError::NotFound)
    }

    /// Move a non-terminal run forward to `stage`, stamping the completion
    /// time of the stage being left behind.
    pub async fn advance_stage(
        pool: &SqlitePool,
        id: Uuid,
        stage: RunStage,
    ) -> Result<Self, RunError> {
        let query = match stage {
            RunStage::BuildVerify => {
                r#"UPDATE runs
                   SET stage = 'build_verify',
                       status = 'executing',
                       planning_completed_at = datetime('now', 'subsec'),
                       updated_at = datetime('now', 'subsec')
                   WHERE id = ?1 AND status IN ('planning', 'executing')
                   RETURNING *"#
            }
            RunStage::ArtifactFanout => {
                r#"UPDATE runs
                   SET stage = 'artifact_fanout',
                       status = 'executing',
                       build_verify_completed_at = datetime('now', 'subsec'),
                       updated_at = datetime('now', 'subsec')
                   WHERE id = ?1 AND status IN ('planning', 'executing')
                   RETURNING *"#
            }
            RunStage::Planning | RunStage::Complete => {
                return Err(RunError::InvalidTransition(format!(
                    "cannot advance into {} stage",
                    stage
                )));
            }
        };

        match sqlx::query_as::<_, Run>(query)
            .bind(id)
            .fetch_optional(pool)
            .await?
        {
            Some(run) => Ok(run),
            None => match Self::find_by_id(pool, id).await? {
                Some(run) => Err(RunError::InvalidTransition(format!(
                    "cannot advance a {} run",
                    run.status
                ))),
                None => Err(RunError::NotFound),
            },
        }
    }

    /// Terminal success: the stage graph was fully traversed. Failed work
    /// items are carried in `failed_items` rather than failing the run.
    pub async fn mark_ready(
        pool: &SqlitePool,
        id: Uuid,
        failed_items: i64,
    ) -> Result<Self, RunError> {
        match sqlx::query_as::<_, Run>(
            r#"UPDATE runs
               SET stage = 'complete',
                   status = 'ready',
                   failed_items = ?2,
                   fanout_completed_at = datetime('now', 'subsec'),
                   updated_at = datetime('now', 'subsec')
               WHERE id = ?1 AND status IN ('planning', 'executing')
               RETURNING *"#,
        )
        .bind(id)
        .bind(failed_items)
        .fetch_optional(pool)
        .await?
        {
            Some(run) => Ok(run),
            None => match Self::find_by_id(pool, id).await? {
                Some(run) => Err(RunError::InvalidTransition(format!(
                    "cannot mark a {} run ready",
                    run.status
                ))),
                None => Err(RunError::NotFound),
            },
        }
    }

    /// Terminal failure from any non-terminal stage.
    pub async fn mark_failed(pool: &SqlitePool, id: Uuid, error: &str) -> Result<Self, RunError> {
        match sqlx::query_as::<_, Run>(
            r#"UPDATE runs
               SET status = 'failed',
                   error = ?2,
                   updated_at = datetime('now', 'subsec')
               WHERE id = ?1 AND status IN ('planning', 'executing')
               RETURNING *"#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(pool)
        .await?
        {
            Some(run) => Ok(run),
            None => match Self::find_by_id(pool, id).await? {
                Some(run) => Err(RunError::InvalidTransition(format!(
                    "cannot fail a {} run",
                    run.status
                ))),
                None => Err(RunError::NotFound),
            },
        }
    }

    /// Archiving is only allowed once a run has settled in ready or failed.
    pub async fn archive(pool: &SqlitePool, id: Uuid) -> Result<Self, RunError> {
        match sqlx::query_as::<_, Run>(
            r#"UPDATE runs
               SET status = 'archived',
                   updated_at = datetime('now', 'subsec')
               WHERE id = ?1 AND status IN ('ready', 'failed')
               RETURNING *"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?
        {
            Some(run) => Ok(run),
            None => match Self::find_by_id(pool, id).await? {
                Some(run) => Err(RunError::InvalidTransition(format!(
                    "cannot archive a {} run",
                    run.status
                ))),
                None => Err(RunError::NotFound),
            },
        }
    }

    pub async fn set_failed_items(
        pool: &SqlitePool,
        id: Uuid,
        failed_items: i64,
    ) -> Result<Self, RunError> {
        sqlx::query_as::<_, Run>(
            r#"UPDATE runs
               SET failed_items = ?2,
                   updated_at = datetime('now', 'subsec')
               WHERE id = ?1
               RETURNING *"#,
        )
        .bind(id)
        .bind(failed_items)
        .fetch_optional(pool)
        .await?
        .ok_or(RunError::NotFound)
    }
}
