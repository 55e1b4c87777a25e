//! Forensic copies of reads that killed a connection.

use crate::utils::unix_millis;
use log::{debug, info};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    dir: Option<PathBuf>,
}

impl CaptureSink {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// `<dir>/<account id or "anon">_<unix millis>.bin`
    pub fn path_for(&self, account_id: Option<u32>, millis: u64) -> Option<PathBuf> {
        let owner = account_id.map_or_else(|| "anon".to_string(), |id| id.to_string());
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_{}.bin", owner, millis)))
    }

    /// Writes `bytes` out. Best effort: any failure is logged and swallowed.
    pub async fn capture(&self, account_id: Option<u32>, bytes: &[u8]) -> Option<PathBuf> {
        let path = self.path_for(account_id, unix_millis())?;
        let dir = self.dir.as_ref()?;

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            debug!("Capture dir {} unavailable: {}", dir.display(), e);
            return None;
        }
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => {
                info!("Captured {} bytes to {}", bytes.len(), path.display());
                Some(path)
            }
            Err(e) => {
                debug!("Capture to {} failed: {}", path.display(), e);
                None
            }
        }
    }
}
