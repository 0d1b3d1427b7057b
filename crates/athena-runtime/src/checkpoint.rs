//! Per-task checkpoint persistence.
//!
//! Each stateful task's snapshot lives in its own file named after the task
//! inside the configured state directory. Snapshots are opaque bytes; the
//! component owns their encoding. Writes go to a temporary sibling first and
//! are renamed into place, so a crash mid-write leaves the previous
//! checkpoint intact.
//!
//! Persistence failures are reported as [`AthenaError::Persistence`]; the
//! engine logs them and carries on.

use std::path::{Path, PathBuf};

use bytes::Bytes;

use athena_types::{AthenaError, Result};

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `task`'s checkpoint.
    pub fn path_for(&self, task: &str) -> Result<PathBuf> {
        if task.is_empty()
            || task.starts_with('.')
            || task.contains(['/', '\\'])
        {
            return Err(persistence(task, "task name is not usable as a file name"));
        }
        Ok(self.dir.join(task))
    }

    /// Save `snapshot` atomically, creating the state directory if needed.
    pub async fn save(&self, task: &str, snapshot: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(task)?;
        let tmp = self.dir.join(format!(".{task}.tmp"));

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| persistence(task, e))?;
        tokio::fs::write(&tmp, snapshot)
            .await
            .map_err(|e| persistence(task, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| persistence(task, e))?;

        tracing::debug!(task, path = %path.display(), bytes = snapshot.len(), "Checkpoint saved");
        Ok(path)
    }

    /// Load `task`'s checkpoint.
    ///
    /// Returns `Ok(None)` when no checkpoint exists (first run or after
    /// [`clear`](CheckpointStore::clear)).
    pub async fn load(&self, task: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(task)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence(task, e)),
        }
    }

    /// Delete `task`'s checkpoint if present.
    pub async fn clear(&self, task: &str) -> Result<()> {
        let path = self.path_for(task)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence(task, e)),
        }
    }
}

fn persistence(task: &str, err: impl ToString) -> AthenaError {
    AthenaError::Persistence {
        task: task.to_string(),
        message: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
