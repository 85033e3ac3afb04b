// SPDX-License-Identifier: MIT
//! Checksum-verified session backups.
//!
//! Every save (when backups are enabled) appends a new backup file under
//! `backups/`, named `<session_id>_<backup_id>.json`.  The payload snapshot
//! is the encrypted on-disk session form; the checksum is an HMAC-SHA256
//! over the serialized snapshot, so a flipped byte anywhere in the payload
//! is caught before a restore can clobber the live session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Session, SessionStore, SessionStoreError, StoredSession};

/// One backup snapshot on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub backup_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    /// Encrypted session record as saved, kept as raw JSON so the checksum
    /// covers exactly what was written.
    pub payload_snapshot: serde_json::Value,
    /// HMAC-SHA256 hex digest over the serialized `payload_snapshot`.
    pub checksum: String,
}

impl SessionStore {
    /// Snapshot a session into a new backup file and return the record.
    pub async fn create_backup(
        &self,
        session: &Session,
    ) -> Result<BackupRecord, SessionStoreError> {
        let stored = self.seal(session)?;
        self.write_backup(&stored).await
    }

    /// Restore a session from `backup_id`.
    ///
    /// The checksum is recomputed over the stored payload first; on mismatch
    /// this fails with [`SessionStoreError::BackupCorrupted`] and the live
    /// session file is left untouched.  On success the payload is written
    /// back as the live session and returned decrypted.
    pub async fn restore_from_backup(
        &self,
        backup_id: &str,
    ) -> Result<Session, SessionStoreError> {
        let path = self
            .find_backup_file(backup_id)
            .await?
            .ok_or_else(|| SessionStoreError::BackupNotFound(backup_id.to_string()))?;
        let bytes = tokio::fs::read(&path).await?;
        let record: BackupRecord = serde_json::from_slice(&bytes)?;

        let payload_bytes = serde_json::to_vec(&record.payload_snapshot)?;
        if !self.crypto.verify_checksum(&payload_bytes, &record.checksum) {
            return Err(SessionStoreError::BackupCorrupted(backup_id.to_string()));
        }

        let stored: StoredSession = serde_json::from_value(record.payload_snapshot)?;
        if stored.session_id != record.session_id {
            return Err(SessionStoreError::RecordMismatch {
                expected: record.session_id,
                found: stored.session_id,
            });
        }

        self.write_stored(&stored).await?;
        debug!(backup_id, session_id = %stored.session_id, "session restored from backup");
        Ok(self.unseal(stored))
    }

    /// List backups, optionally restricted to one session, newest first.
    pub async fn list_backups(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<BackupRecord>, SessionStoreError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.backups_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path).await {
                Ok(record) => {
                    if session_id.is_none_or(|id| record.session_id == id) {
                        records.push(record);
                    }
                }
                Err(e) => warn!(file = %path.display(), err = %e, "skipping unreadable backup"),
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    pub(crate) async fn write_backup(
        &self,
        stored: &StoredSession,
    ) -> Result<BackupRecord, SessionStoreError> {
        let payload_snapshot = serde_json::to_value(stored)?;
        let payload_bytes = serde_json::to_vec(&payload_snapshot)?;
        let checksum = self.crypto.create_checksum(&payload_bytes);

        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let record = BackupRecord {
            backup_id: format!("backup-{}-{}", now.timestamp_millis(), &suffix[..8]),
            session_id: stored.session_id.clone(),
            timestamp: now,
            payload_snapshot,
            checksum,
        };

        let path = self
            .backups_dir
            .join(format!("{}_{}.json", record.session_id, record.backup_id));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&record)?).await?;
        debug!(backup_id = %record.backup_id, session_id = %record.session_id, "backup written");
        Ok(record)
    }

    /// Delete backups older than the backup-retention window.  Returns the
    /// number removed.
    pub(crate) async fn prune_backups(&self) -> Result<usize, SessionStoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.options.backup_retention)
                .unwrap_or(chrono::Duration::zero());
        let mut deleted = 0;
        let mut entries = tokio::fs::read_dir(&self.backups_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(record) = read_record(&path).await else {
                continue;
            };
            if record.timestamp < cutoff {
                tokio::fs::remove_file(&path).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn find_backup_file(
        &self,
        backup_id: &str,
    ) -> Result<Option<PathBuf>, SessionStoreError> {
        let suffix = format!("_{backup_id}.json");
        let mut entries = tokio::fs::read_dir(&self.backups_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix))
            {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

async fn read_record(path: &std::path::Path) -> Result<BackupRecord, SessionStoreError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
