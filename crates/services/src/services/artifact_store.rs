use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid artifact path: {0}")]
    InvalidPath(String),
}

/// Flat-file store for generated documents. Rows in the artifacts table
/// hold paths relative to this store's root, so the root can move
/// between deployments without rewriting the database.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Write `content` under `<root>/<run_id>/<kind>.md` and return the
    /// relative path for the artifact row. Writing the same kind twice
    /// for a run overwrites, which keeps re-driven stages idempotent.
    pub async fn store(
        &self,
        run_id: Uuid,
        kind: &str,
        content: &str,
    ) -> Result<String, ArtifactStoreError> {
        if !kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ArtifactStoreError::InvalidPath(kind.to_string()));
        }

        let relative = format!("{}/{}.md", run_id, kind);
        let full = self.root.join(&relative);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(relative)
    }

    pub async fn read(&self, relative: &str) -> Result<String, ArtifactStoreError> {
        if relative.split(['/', '\\']).any(|part| part == "..") {
            return Err(ArtifactStoreError::InvalidPath(relative.to_string()));
        }
        Ok(tokio::fs::read_to_string(self.root.join(relative)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf());
        let run_id = Uuid::new_v4();

        let relative = store
            .store(run_id, "requirements", "# Requirements\n")
            .await
            .unwrap();
        assert_eq!(relative, format!("{}/requirements.md", run_id));

        let content = store.read(&relative).await.unwrap();
        assert_eq!(content, "# Requirements\n");
    }

    #[tokio::test]
    async fn second_write_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf());
        let run_id = Uuid::new_v4();

        store.store(run_id, "user_manual", "draft").await.unwrap();
        let relative = store.store(run_id, "user_manual", "final").await.unwrap();

        assert_eq!(store.read(&relative).await.unwrap(), "final");
    }

    #[tokio::test]
    async fn rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf());

        let err = store
            .store(Uuid::new_v4(), "../evil", "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactStoreError::InvalidPath(_)));

        let err = store.read("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, ArtifactStoreError::InvalidPath(_)));
    }
}
