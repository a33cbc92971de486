//! Best-effort audit trail of delivered actions.
//!
//! Every frame a connection's writer hands to the transport is first offered
//! to the configured [`AuditSink`]. Sink failures are logged by the caller and
//! never reach the client.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use crate::message::EventKind;

/// One delivered action: who received it, what kind it was, in which room.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub user_id: String,
    pub action_type: EventKind,
    pub room_id: String,
    pub message: String,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_action(&self, record: &AuditRecord) -> Result<()>;
}

/// Used when auditing is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn log_action(&self, _record: &AuditRecord) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
///
/// The file handle sits behind an async mutex so concurrent writer tasks
/// never interleave partial lines.
pub struct JsonLinesAuditSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonLinesAuditSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open audit log {}", path.display()))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonLinesAuditSink {
    async fn log_action(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("failed to encode audit record")?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}
