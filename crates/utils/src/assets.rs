use std::path::PathBuf;

use directories::ProjectDirs;

pub const ASSET_DIR_ENV: &str = "MAESTRO_ASSET_DIR";

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");

/// Directory where runtime assets live: the sqlite database, the JSON
/// config and generated artifact files. Resolution order is the
/// `MAESTRO_ASSET_DIR` override, a `dev_assets` folder next to the
/// workspace in debug builds, and the platform data dir in release.
pub fn asset_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ASSET_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    if cfg!(debug_assertions) {
        PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        ProjectDirs::from("ai", "maestro", "maestro")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

pub fn config_path() -> PathBuf {
    asset_dir().join("config.json")
}

pub fn db_path() -> PathBuf {
    asset_dir().join("db.sqlite")
}

pub fn artifact_dir() -> PathBuf {
    asset_dir().join("artifacts")
}
