//! Contact file: written on startup so clients and child jobs can locate
//! the running scheduler, removed on shutdown.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactFile {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub version: String,
    pub uuid: Uuid,
    pub working_directory: PathBuf,
}

impl ContactFile {
    pub fn new(host: impl Into<String>, port: u16, working_directory: PathBuf) -> Self {
        Self {
            host: host.into(),
            port,
            pid: std::process::id(),
            version: crate::version::VERSION.to_string(),
            uuid: Uuid::new_v4(),
            working_directory,
        }
    }

    fn path(run_dir: &Path) -> PathBuf {
        run_dir.join(".service").join("contact")
    }

    pub async fn write(&self, run_dir: &Path) -> std::io::Result<()> {
        let path = Self::path(run_dir);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(self).expect("contact file is always serializable");
        tokio::fs::write(path, contents).await
    }

    pub async fn read(run_dir: &Path) -> std::io::Result<Self> {
        let contents = tokio::fs::read_to_string(Self::path(run_dir)).await?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub async fn remove(run_dir: &Path) -> std::io::Result<()> {
        match tokio::fs::remove_file(Self::path(run_dir)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_remove_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let contact = ContactFile::new("localhost", 7766, dir.path().to_path_buf());
        contact.write(dir.path()).await.unwrap();

        let read_back = ContactFile::read(dir.path()).await.unwrap();
        assert_eq!(read_back.port, 7766);

        ContactFile::remove(dir.path()).await.unwrap();
        assert!(ContactFile::read(dir.path()).await.is_err());
    }
}
