use std::path::PathBuf;

use crate::assets::asset_dir;

fn port_file_path() -> PathBuf {
    asset_dir().join("maestro.port")
}

/// Record the port the server actually bound so companion tooling can
/// discover a server started on an ephemeral port.
pub async fn write_port_file(port: u16) -> std::io::Result<()> {
    let path = port_file_path();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, port.to_string()).await
}

pub async fn read_port_file() -> std::io::Result<u16> {
    let contents = tokio::fs::read_to_string(port_file_path()).await?;
    contents
        .trim()
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
