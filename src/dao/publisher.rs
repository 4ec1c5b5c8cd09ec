// src/dao/publisher.rs - Report publisher writing into a served directory

use async_trait::async_trait;
use log::{debug, info};
use std::path::PathBuf;

use crate::dao::ReportPublisher;
use crate::types::BotError;

/// Writes each report as `<dir>/<name>`; the directory is expected to be
/// served at the configured website prefix.
pub struct DirectoryPublisher {
    dir: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn is_safe_name(name: &str) -> bool {
        !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\'])
    }
}

#[async_trait]
impl ReportPublisher for DirectoryPublisher {
    async fn publish(&self, name: &str, content: &str) -> Result<(), BotError> {
        if !Self::is_safe_name(name) {
            return Err(BotError::publisher(format!("refusing report name '{}'", name)));
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| BotError::publisher(format!("create {}: {}", self.dir.display(), e)))?;

        let path = self.dir.join(name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| BotError::publisher(format!("write {}: {}", path.display(), e)))?;

        debug!("Wrote {} bytes to {}", content.len(), path.display());
        info!("Published report '{}'", name);
        Ok(())
    }
}
