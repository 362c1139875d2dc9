//! NDJSON file dead-letter store
//!
//! One JSON record per line. Enqueue appends and syncs; drain and purge rewrite the
//! file through a temporary sibling and an atomic rename. All operations share one
//! async mutex, so a drain never observes a half-written file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::DeadLetterRecord;

use super::DeadLetterStore;

/// Dead-letter store persisted as an NDJSON file
#[derive(Debug)]
pub struct FileDeadLetterStore {
    path: PathBuf,
    retention: Duration,
    depth: Mutex<u64>,
}

impl FileDeadLetterStore {
    /// Open (or create) the store at `path`
    pub async fn open(path: impl Into<PathBuf>, retention: Duration) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::storage(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let lines = read_lines(&path).await?;
        debug!(path = %path.display(), depth = lines.len(), "Opened dead-letter file");

        Ok(Self {
            path,
            retention,
            depth: Mutex::new(lines.len() as u64),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file contents with `lines`
    async fn rewrite(&self, lines: &[String]) -> Result<()> {
        let tmp = self.path.with_extension("ndjson.tmp");
        let mut contents = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            contents.push_str(line);
            contents.push('\n');
        }

        let mut file = fs::File::create(&tmp).await.map_err(storage_err(&tmp))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(storage_err(&tmp))?;
        file.sync_all().await.map_err(storage_err(&tmp))?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .await
            .map_err(storage_err(&self.path))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn enqueue(&self, record: DeadLetterRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut depth = self.depth.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(storage_err(&self.path))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(storage_err(&self.path))?;
        file.sync_data().await.map_err(storage_err(&self.path))?;

        *depth += 1;
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        Ok(*self.depth.lock().await)
    }

    async fn drain(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let mut depth = self.depth.lock().await;
        let lines = read_lines(&self.path).await?;

        let mut drained = Vec::new();
        let mut kept = Vec::new();
        for line in lines {
            if drained.len() >= limit {
                kept.push(line);
                continue;
            }
            match serde_json::from_str::<DeadLetterRecord>(&line) {
                Ok(record) => drained.push(record),
                Err(e) => {
                    warn!(error = %e, "Keeping unreadable dead-letter line in place");
                    kept.push(line);
                }
            }
        }

        if !drained.is_empty() {
            self.rewrite(&kept).await?;
        }
        *depth = kept.len() as u64;
        Ok(drained)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut depth = self.depth.lock().await;
        let lines = read_lines(&self.path).await?;
        let before = lines.len();

        let kept: Vec<String> = lines
            .into_iter()
            .filter(|line| {
                serde_json::from_str::<DeadLetterRecord>(line)
                    .map_or(true, |r| !r.is_expired(now, self.retention))
            })
            .collect();

        let removed = before - kept.len();
        if removed > 0 {
            self.rewrite(&kept).await?;
        }
        *depth = kept.len() as u64;
        Ok(removed)
    }

    async fn health_check(&self) -> Result<()> {
        let _guard = self.depth.lock().await;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(storage_err(&self.path))?;
        Ok(())
    }
}

async fn read_lines(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_owned)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::storage(format!("cannot read {}: {e}", path.display()))),
    }
}

fn storage_err(path: &Path) -> impl Fn(std::io::Error) -> Error + '_ {
    move |e| Error::storage(format!("{}: {e}", path.display()))
}
