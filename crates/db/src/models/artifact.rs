use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("artifact not found")]
    NotFound,
}

/// Reference to a generated document. `kind` is free-form because the
/// fan-out task set is configurable; `path` is relative to the artifact
/// store root.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TS)]
#[ts(export)]
pub struct Artifact {
    pub id: Uuid,
    pub run_id: Uuid,
    pub kind: String,
    pub title: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CreateArtifact {
    pub run_id: Uuid,
    pub kind: String,
    pub title: String,
    pub path: String,
}

impl Artifact {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateArtifact,
        id: Uuid,
    ) -> Result<Self, ArtifactError> {
        Ok(sqlx::query_as::<_, Artifact>(
            r#"INSERT INTO artifacts (id, run_id, kind, title, path)
               VALUES (?1, ?2, ?3, ?4, ?5)
               RETURNING *"#,
        )
        .bind(id)
        .bind(data.run_id)
        .bind(&data.kind)
        .bind(&data.title)
        .bind(&data.path)
        .fetch_one(pool)
        .await?)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, ArtifactError> {
        Ok(
            sqlx::query_as::<_, Artifact>(r#"SELECT * FROM artifacts WHERE id = ?1"#)
                .bind(id)
                .fetch_optional(pool)
                .await?,
        )
    }

    pub async fn find_by_run(pool: &SqlitePool, run_id: Uuid) -> Result<Vec<Self>, ArtifactError> {
        Ok(sqlx::query_as::<_, Artifact>(
            r#"SELECT * FROM artifacts WHERE run_id = ?1 ORDER BY created_at ASC, rowid ASC"#,
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?)
    }

    pub async fn count_by_run(pool: &SqlitePool, run_id: Uuid) -> Result<i64, ArtifactError> {
        Ok(
            sqlx::query_scalar(r#"SELECT COUNT(*) FROM artifacts WHERE run_id = ?1"#)
                .bind(run_id)
                .fetch_one(pool)
                .await?,
        )
    }
}
