//! `file` source: tails a text file, one event per line.
//!
//! The read position is a byte offset that survives restarts through the
//! checkpoint store. Only complete lines are emitted while following; a
//! trailing line without a newline is emitted at EOF when `follow` is off.
//! If the file shrinks below the stored offset it is assumed to have been
//! truncated and is read again from the start.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, warn};

use athena_runtime::{Component, ComponentContext, EmitNext, Source, Stateful};
use athena_types::{AthenaError, Event, Meta, PropertyDescriptor, PropertyKind, Result, Value};

use crate::opened;

fn path_def() -> PropertyDescriptor {
    PropertyDescriptor::required("path", "File to read", PropertyKind::String)
}

fn poll_interval_def() -> PropertyDescriptor {
    PropertyDescriptor::optional(
        "poll-interval",
        "How often to check for appended data at EOF",
        PropertyKind::Duration,
        serde_json::json!("1s"),
    )
}

fn follow_def() -> PropertyDescriptor {
    PropertyDescriptor::optional(
        "follow",
        "Keep waiting for appended lines instead of finishing at EOF",
        PropertyKind::Bool,
        serde_json::json!(true),
    )
}

#[derive(Debug, Serialize, Deserialize)]
struct FileCheckpoint {
    path: PathBuf,
    offset: u64,
}

#[derive(Default)]
pub struct FileSource {
    ctx: OnceLock<ComponentContext>,
    path: OnceLock<PathBuf>,
    offset: AtomicU64,
}

impl FileSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte position after the last emitted line.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    fn path(&self) -> Result<&PathBuf> {
        self.path
            .get()
            .ok_or_else(|| AthenaError::component("file", "collect", "component was not opened"))
    }
}

#[async_trait]
impl Component for FileSource {
    fn property_definition(&self) -> Vec<PropertyDescriptor> {
        vec![path_def(), poll_interval_def(), follow_def()]
    }

    async fn open(&self, ctx: ComponentContext) -> Result<()> {
        let path = PathBuf::from(ctx.properties().string(&path_def())?);
        let _ = self.path.set(path);
        let _ = self.ctx.set(ctx);
        Ok(())
    }

    fn as_stateful(&self) -> Option<&dyn Stateful> {
        Some(self)
    }
}

#[async_trait]
impl Stateful for FileSource {
    async fn snapshot(&self) -> Result<Bytes> {
        let checkpoint = FileCheckpoint {
            path: self.path()?.clone(),
            offset: self.offset(),
        };
        Ok(Bytes::from(serde_json::to_vec(&checkpoint)?))
    }

    async fn restore(&self, snapshot: Bytes) -> Result<()> {
        let checkpoint: FileCheckpoint = serde_json::from_slice(&snapshot)?;
        let path = self.path()?;
        if &checkpoint.path != path {
            warn!(
                stored = %checkpoint.path.display(),
                configured = %path.display(),
                "Checkpoint belongs to another file, reading from the start"
            );
            return Ok(());
        }
        self.offset.store(checkpoint.offset, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl Source for FileSource {
    async fn collect(&self, next: EmitNext) -> Result<()> {
        let ctx = opened(&self.ctx, "file", "collect")?;
        let path = self.path()?.clone();
        let poll = ctx.properties().duration(&poll_interval_def())?;
        let follow = ctx.properties().bool(&follow_def())?;
        let io_err = |e: std::io::Error| {
            AthenaError::component(ctx.name(), "collect", format!("{}: {e}", path.display()))
        };

        let file = tokio::fs::File::open(&path).await.map_err(io_err)?;
        let len = file.metadata().await.map_err(io_err)?.len();
        let mut offset = self.offset();
        if offset > len {
            warn!(path = %path.display(), offset, len, "File shrank, reading from the start");
            offset = 0;
            self.offset.store(0, Ordering::Release);
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        debug!(path = %path.display(), offset, "Reading");

        let file_name = path.display().to_string();
        let mut line = Vec::new();
        loop {
            if ctx.is_cancelled() {
                return Ok(());
            }
            let read = reader.read_until(b'\n', &mut line).await.map_err(io_err)?;
            let complete = line.last() == Some(&b'\n');
            let at_eof = read == 0 || !complete;

            if complete || (at_eof && !follow && !line.is_empty()) {
                let start = offset;
                offset += line.len() as u64;
                let text = String::from_utf8_lossy(&line)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                line.clear();

                let mut meta = Meta::new();
                meta.insert("file".into(), Value::from(file_name.as_str()));
                meta.insert("offset".into(), Value::Int(start as i64));
                next.emit(Event::new(meta, text)).await;
                self.offset.store(offset, Ordering::Release);
                continue;
            }

            if at_eof {
                if !follow {
                    return Ok(());
                }
                tokio::select! {
                    _ = ctx.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }
}
