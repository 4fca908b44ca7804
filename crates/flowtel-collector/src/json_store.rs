//! Newline-delimited JSON store.
//!
//! Each appended record becomes one JSON object per line. A batch is
//! written with a single `write_all` followed by a flush, so a batch is
//! either fully appended or reported as failed. The same file format
//! backs both flow snapshots and switch status rows.

use async_trait::async_trait;
use flowtel_common::{FlowStore, PersistedFlow, StoreError, SwitchStatus, SwitchStatusStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Append-only JSON-lines file store.
pub struct JsonLinesStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesStore {
    /// Opens (creating if needed) the file at `path` for appending.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append<T: Serialize>(&self, records: &[T]) -> Result<(), StoreError> {
        let mut buf = Vec::with_capacity(records.len() * 256);
        for record in records {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            buf.push(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buf)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        debug!(records = records.len(), path = %self.path.display(), "Appended JSON lines");
        Ok(())
    }
}

#[async_trait]
impl FlowStore for JsonLinesStore {
    async fn append_flow_batch(&self, records: &[PersistedFlow]) -> Result<(), StoreError> {
        self.append(records).await
    }
}

#[async_trait]
impl SwitchStatusStore for JsonLinesStore {
    async fn upsert_switch_status(
        &self,
        _switch_id: &str,
        status: SwitchStatus,
    ) -> Result<(), StoreError> {
        // Rows are appended; the newest row for a switch is its status.
        self.append(std::slice::from_ref(&status)).await
    }
}
