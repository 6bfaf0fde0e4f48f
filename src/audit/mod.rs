//! Append-only audit log.
//!
//! One JSON record per line. Rotation happens between records, never
//! mid-write, at 10 MB with 5 numbered backups. The log is a value threaded
//! through the engine, not process-wide state, so parallel engines (and
//! parallel tests) each own their file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::RecoveryAttempt;

const MAX_BYTES: u64 = 10 * 1024 * 1024;
const BACKUPS: u32 = 5;

/// One audit record. Append-only; never mutated after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub operation: String,
    pub actor: String,
    pub dry_run: bool,
    pub parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_state: Option<Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub recovery_attempts: Vec<RecoveryAttempt>,
    pub duration_ms: u64,
}

impl AuditRecord {
    pub fn new(device_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            device_id: device_id.into(),
            operation: operation.into(),
            actor: "system".to_string(),
            dry_run: false,
            parameters: Value::Null,
            before_state: None,
            after_state: None,
            success: false,
            error: None,
            recovery_attempts: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Query filter for reading records back.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub device_id: Option<String>,
    pub operation: Option<String>,
    pub limit: usize,
}

/// JSON-lines audit log with size-based rotation.
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Rotation is checked before the write so a record
    /// is never split across files.
    pub async fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        if let Ok(meta) = tokio::fs::metadata(&self.path).await {
            if meta.len() + line.len() as u64 + 1 > MAX_BYTES {
                self.rotate().await?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Append, downgrading failures to a warning. The engine's contract is
    /// one record per operation; losing the record to a full disk must not
    /// mask the operation's own result.
    pub async fn append_or_warn(&self, record: &AuditRecord) {
        if let Err(e) = self.append(record).await {
            warn!("failed to write audit record for {}: {e}", record.device_id);
        }
    }

    async fn rotate(&self) -> std::io::Result<()> {
        // shift audit.log.4 -> audit.log.5 ... audit.log -> audit.log.1
        for n in (1..BACKUPS).rev() {
            let from = self.backup_path(n);
            if tokio::fs::metadata(&from).await.is_ok() {
                tokio::fs::rename(&from, self.backup_path(n + 1)).await?;
            }
        }
        if tokio::fs::metadata(&self.path).await.is_ok() {
            tokio::fs::rename(&self.path, self.backup_path(1)).await?;
        }
        Ok(())
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// Read recent records, newest first, applying the filter.
    pub async fn recent(&self, filter: &AuditFilter) -> std::io::Result<Vec<AuditRecord>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records: Vec<AuditRecord> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .filter(|r: &AuditRecord| {
                filter
                    .device_id
                    .as_ref()
                    .map_or(true, |d| &r.device_id == d)
                    && filter
                        .operation
                        .as_ref()
                        .map_or(true, |o| &r.operation == o)
            })
            .collect();

        records.reverse();
        if filter.limit > 0 {
            records.truncate(filter.limit);
        }
        Ok(records)
    }
}
