// SPDX-License-Identifier: MIT
//! Durable, resumable formation-session persistence.
//!
//! One JSON file per session under the storage dir, an `active_session.json`
//! marker pointing at the session a resumed CLI should pick up, and a
//! `backups/` subdirectory of checksum-verified snapshots (see [`backup`]).
//!
//! Sensitive fields — shareholder SSNs and payment details — are encrypted
//! at rest via [`CryptoService`] and transparently decrypted on load.  The
//! in-memory [`Session`] always holds plaintext; the on-disk form never
//! does.  Once a session reaches a terminal status its sensitive fields are
//! scrubbed and never come back.
//!
//! The store is constructed explicitly and passed to whoever needs it —
//! there is no process-wide singleton.  Concurrent writers to the *same*
//! session id are not synchronized; treat per-id access as single-writer.

pub mod backup;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::clients::RegisteredAgent;
use crate::crypto::{CryptoError, CryptoService, Envelope, PaymentInfo};

const ACTIVE_MARKER: &str = "active_session.json";
const BACKUPS_DIR: &str = "backups";

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// The `sessionId` field inside a file disagrees with the id derived
    /// from its filename.
    #[error("session record mismatch: file for {expected:?} contains {found:?}")]
    RecordMismatch { expected: String, found: String },

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    /// Checksum verification over the backup payload failed.
    #[error("backup {0} is corrupted: checksum mismatch")]
    BackupCorrupted(String),
}

// ─── Session model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Abandoned)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::InProgress => write!(f, "in_progress"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// In-memory session state: sensitive fields are plaintext here and only
/// here.  The store never mutates a caller's `Session` in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_step: String,
    pub status: SessionStatus,
    pub company_data: CompanyData,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyData {
    #[serde(default)]
    pub company_name: Option<String>,
    /// "llc" | "c_corp" | "s_corp"
    #[serde(default)]
    pub company_type: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub registered_agent: Option<RegisteredAgent>,
    #[serde(default)]
    pub shareholders: Vec<Shareholder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shareholder {
    pub name: String,
    pub ownership_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssn: Option<String>,
}

/// Shallow-overwrite patch for [`CompanyData`]: `Some` fields replace the
/// existing value wholesale, `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct CompanyDataPatch {
    pub company_name: Option<String>,
    pub company_type: Option<String>,
    pub state: Option<String>,
    pub registered_agent: Option<RegisteredAgent>,
    pub shareholders: Option<Vec<Shareholder>>,
    pub payment: Option<PaymentInfo>,
}

impl CompanyDataPatch {
    fn apply(self, data: &mut CompanyData) {
        if let Some(v) = self.company_name {
            data.company_name = Some(v);
        }
        if let Some(v) = self.company_type {
            data.company_type = Some(v);
        }
        if let Some(v) = self.state {
            data.state = Some(v);
        }
        if let Some(v) = self.registered_agent {
            data.registered_agent = Some(v);
        }
        if let Some(v) = self.shareholders {
            data.shareholders = v;
        }
        if let Some(v) = self.payment {
            data.payment = Some(v);
        }
    }
}

/// Lightweight listing row — no decryption performed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub current_step: String,
    pub company_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    pub status: Option<SessionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

// ─── On-disk form ─────────────────────────────────────────────────────────────

/// Serialized session record: identical to [`Session`] except sensitive
/// fields are envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredSession {
    pub(crate) session_id: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) current_step: String,
    pub(crate) status: SessionStatus,
    pub(crate) company_data: StoredCompanyData,
    #[serde(default)]
    pub(crate) metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredCompanyData {
    #[serde(default)]
    pub(crate) company_name: Option<String>,
    #[serde(default)]
    pub(crate) company_type: Option<String>,
    #[serde(default)]
    pub(crate) state: Option<String>,
    #[serde(default)]
    pub(crate) registered_agent: Option<RegisteredAgent>,
    #[serde(default)]
    pub(crate) shareholders: Vec<StoredShareholder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) payment: Option<StoredPayment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredShareholder {
    pub(crate) name: String,
    pub(crate) ownership_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) ssn: Option<Envelope>,
}

/// Masked last-4 stays readable; the envelope holds the (already masked)
/// payment object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredPayment {
    pub(crate) last4: String,
    pub(crate) envelope: Envelope,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveMarker {
    session_id: String,
}

// ─── Store ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionStoreOptions {
    /// Write a checksummed backup on every save.
    pub backups_enabled: bool,
    /// Terminal sessions older than this are removed by cleanup.
    pub session_retention: Duration,
    /// Backups older than this are removed by cleanup.
    pub backup_retention: Duration,
}

impl Default for SessionStoreOptions {
    fn default() -> Self {
        Self {
            backups_enabled: true,
            session_retention: Duration::from_secs(30 * 24 * 3600),
            backup_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub sessions_deleted: usize,
    pub backups_deleted: usize,
}

pub struct SessionStore {
    dir: PathBuf,
    backups_dir: PathBuf,
    crypto: Arc<CryptoService>,
    options: SessionStoreOptions,
}

impl SessionStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn new(
        dir: impl Into<PathBuf>,
        crypto: Arc<CryptoService>,
        options: SessionStoreOptions,
    ) -> Result<Self, SessionStoreError> {
        let dir = dir.into();
        let backups_dir = dir.join(BACKUPS_DIR);
        tokio::fs::create_dir_all(&backups_dir).await?;
        Ok(Self {
            dir,
            backups_dir,
            crypto,
            options,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.dir
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    /// Allocate a new `in_progress` session, persist it, and mark it active.
    pub async fn create_session(
        &self,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Session, SessionStoreError> {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let session = Session {
            session_id: format!("session-{}-{}", now.timestamp_millis(), &suffix[..8]),
            created_at: now,
            updated_at: now,
            current_step: "start".to_string(),
            status: SessionStatus::InProgress,
            company_data: CompanyData::default(),
            metadata,
        };
        self.save_session(&session).await?;
        self.set_active(&session.session_id).await?;
        info!(session_id = %session.session_id, "session created");
        Ok(session)
    }

    /// Persist a session.  Sensitive fields are encrypted into a deep copy;
    /// the caller's `Session` is untouched.  Writes a checksummed backup
    /// when backups are enabled.
    pub async fn save_session(&self, session: &Session) -> Result<(), SessionStoreError> {
        let stored = self.seal(session)?;
        self.write_stored(&stored).await?;
        if self.options.backups_enabled {
            self.write_backup(&stored).await?;
        }
        Ok(())
    }

    /// Load and decrypt a session.  `Ok(None)` when the file does not exist.
    /// A sensitive sub-field that fails decryption is dropped with a warning
    /// rather than failing the whole load.
    pub async fn load_session(&self, id: &str) -> Result<Option<Session>, SessionStoreError> {
        match self.read_stored(id).await? {
            Some(stored) => Ok(Some(self.unseal(stored))),
            None => Ok(None),
        }
    }

    /// Load, shallow-merge `patch` into the company data, optionally advance
    /// the step, and save.  `Ok(None)` when the session does not exist.
    pub async fn update_session(
        &self,
        id: &str,
        patch: CompanyDataPatch,
        current_step: Option<&str>,
    ) -> Result<Option<Session>, SessionStoreError> {
        let Some(mut session) = self.load_session(id).await? else {
            return Ok(None);
        };
        patch.apply(&mut session.company_data);
        if let Some(step) = current_step {
            session.current_step = step.to_string();
        }
        session.updated_at = Utc::now();
        self.save_session(&session).await?;
        Ok(Some(session))
    }

    /// Find the session an interrupted run should pick up: the tracked
    /// active session if it is still `in_progress`, otherwise the most
    /// recently updated `in_progress` session.
    pub async fn resume_session(&self) -> Result<Option<Session>, SessionStoreError> {
        if let Some(active_id) = self.read_active().await {
            match self.load_session(&active_id).await? {
                Some(session) if session.status == SessionStatus::InProgress => {
                    return Ok(Some(session));
                }
                _ => {
                    // Stale pointer: the session is gone or terminal.
                    self.clear_active().await?;
                }
            }
        }

        let mut candidates: Vec<StoredSession> = self
            .read_all_stored()
            .await?
            .into_iter()
            .filter(|s| s.status == SessionStatus::InProgress)
            .collect();
        candidates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        match candidates.into_iter().next() {
            Some(stored) => {
                self.set_active(&stored.session_id).await?;
                Ok(Some(self.unseal(stored)))
            }
            None => Ok(None),
        }
    }

    /// Mark a session completed and scrub its sensitive fields irreversibly.
    /// Returns `false` when the session does not exist.
    pub async fn complete_session(&self, id: &str) -> Result<bool, SessionStoreError> {
        self.finish(id, SessionStatus::Completed).await
    }

    /// Mark a session abandoned.  Sensitive fields are scrubbed here too —
    /// a terminal session never retains an SSN or payment data.
    pub async fn abandon_session(&self, id: &str) -> Result<bool, SessionStoreError> {
        self.finish(id, SessionStatus::Abandoned).await
    }

    async fn finish(&self, id: &str, status: SessionStatus) -> Result<bool, SessionStoreError> {
        let Some(mut stored) = self.read_stored(id).await? else {
            return Ok(false);
        };
        stored.status = status;
        stored.updated_at = Utc::now();
        scrub(&mut stored.company_data);
        self.write_stored(&stored).await?;
        if self.read_active().await.as_deref() == Some(id) {
            self.clear_active().await?;
        }
        info!(session_id = %id, status = %status, "session closed");
        Ok(true)
    }

    /// Remove a session file outright.  Returns `false` when absent.
    pub async fn delete_session(&self, id: &str) -> Result<bool, SessionStoreError> {
        let path = self.session_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                if self.read_active().await.as_deref() == Some(id) {
                    self.clear_active().await?;
                }
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List sessions matching `query`, most recently updated first.
    pub async fn list_sessions(
        &self,
        query: &SessionQuery,
    ) -> Result<Vec<SessionSummary>, SessionStoreError> {
        let mut rows: Vec<SessionSummary> = self
            .read_all_stored()
            .await?
            .into_iter()
            .filter(|s| {
                query.status.is_none_or(|q| s.status == q)
                    && query.created_after.is_none_or(|t| s.created_at > t)
                    && query.created_before.is_none_or(|t| s.created_at < t)
                    && query.updated_after.is_none_or(|t| s.updated_at > t)
            })
            .map(|s| SessionSummary {
                session_id: s.session_id,
                status: s.status,
                current_step: s.current_step,
                company_name: s.company_data.company_name,
                created_at: s.created_at,
                updated_at: s.updated_at,
            })
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    /// Delete terminal sessions past the session-retention window and
    /// backups past the backup-retention window.
    pub async fn cleanup_old_sessions(&self) -> Result<CleanupReport, SessionStoreError> {
        let session_cutoff = Utc::now()
            - chrono::Duration::from_std(self.options.session_retention)
                .unwrap_or(chrono::Duration::zero());
        let mut sessions_deleted = 0;
        for stored in self.read_all_stored().await? {
            if stored.status.is_terminal()
                && stored.updated_at < session_cutoff
                && self.delete_session(&stored.session_id).await?
            {
                sessions_deleted += 1;
            }
        }

        let backups_deleted = self.prune_backups().await?;
        if sessions_deleted > 0 || backups_deleted > 0 {
            info!(sessions_deleted, backups_deleted, "retention cleanup done");
        }
        Ok(CleanupReport {
            sessions_deleted,
            backups_deleted,
        })
    }

    // ─── Seal / unseal ────────────────────────────────────────────────────────

    fn seal(&self, session: &Session) -> Result<StoredSession, SessionStoreError> {
        let data = &session.company_data;
        let shareholders = data
            .shareholders
            .iter()
            .map(|sh| {
                let ssn = sh
                    .ssn
                    .as_deref()
                    .map(|raw| self.crypto.encrypt_ssn(raw))
                    .transpose()?;
                Ok(StoredShareholder {
                    name: sh.name.clone(),
                    ownership_percent: sh.ownership_percent,
                    ssn,
                })
            })
            .collect::<Result<Vec<_>, CryptoError>>()?;

        let payment = data
            .payment
            .as_ref()
            .map(|p| {
                let (envelope, last4) = self.crypto.encrypt_payment_info(p)?;
                Ok(StoredPayment { last4, envelope })
            })
            .transpose()
            .map_err(SessionStoreError::Crypto)?;

        Ok(StoredSession {
            session_id: session.session_id.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            current_step: session.current_step.clone(),
            status: session.status,
            company_data: StoredCompanyData {
                company_name: data.company_name.clone(),
                company_type: data.company_type.clone(),
                state: data.state.clone(),
                registered_agent: data.registered_agent.clone(),
                shareholders,
                payment,
            },
            metadata: session.metadata.clone(),
        })
    }

    fn unseal(&self, stored: StoredSession) -> Session {
        let data = stored.company_data;
        let shareholders = data
            .shareholders
            .into_iter()
            .map(|sh| {
                let ssn = sh.ssn.and_then(|env| match self.crypto.decrypt(&env) {
                    Ok(plain) => Some(plain),
                    Err(e) => {
                        warn!(session_id = %stored.session_id, err = %e,
                            "dropping undecryptable SSN field");
                        None
                    }
                });
                Shareholder {
                    name: sh.name,
                    ownership_percent: sh.ownership_percent,
                    ssn,
                }
            })
            .collect();

        let payment = data.payment.and_then(|p| {
            match self.crypto.decrypt_object::<PaymentInfo>(&p.envelope) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(session_id = %stored.session_id, err = %e,
                        "dropping undecryptable payment field");
                    None
                }
            }
        });

        Session {
            session_id: stored.session_id,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            current_step: stored.current_step,
            status: stored.status,
            company_data: CompanyData {
                company_name: data.company_name,
                company_type: data.company_type,
                state: data.state,
                registered_agent: data.registered_agent,
                shareholders,
                payment,
            },
            metadata: stored.metadata,
        }
    }

    // ─── File plumbing ────────────────────────────────────────────────────────

    fn session_path(&self, id: &str) -> Result<PathBuf, SessionStoreError> {
        // Session ids become filenames; reject anything that could escape
        // the storage dir.
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SessionStoreError::InvalidSessionId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn write_stored(&self, stored: &StoredSession) -> Result<(), SessionStoreError> {
        let path = self.session_path(&stored.session_id)?;
        let bytes = serde_json::to_vec_pretty(stored)?;
        tokio::fs::write(&path, bytes).await?;
        debug!(session_id = %stored.session_id, "session written");
        Ok(())
    }

    async fn read_stored(&self, id: &str) -> Result<Option<StoredSession>, SessionStoreError> {
        let path = self.session_path(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredSession = serde_json::from_slice(&bytes)?;
        if stored.session_id != id {
            return Err(SessionStoreError::RecordMismatch {
                expected: id.to_string(),
                found: stored.session_id,
            });
        }
        Ok(Some(stored))
    }

    async fn read_all_stored(&self) -> Result<Vec<StoredSession>, SessionStoreError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !stem.starts_with("session-") {
                continue;
            }
            match self.read_stored(stem).await {
                Ok(Some(stored)) => out.push(stored),
                Ok(None) => {}
                Err(e) => {
                    warn!(file = %path.display(), err = %e, "skipping unreadable session file");
                }
            }
        }
        Ok(out)
    }

    // ─── Active-session marker ────────────────────────────────────────────────

    async fn set_active(&self, id: &str) -> Result<(), SessionStoreError> {
        let marker = ActiveMarker {
            session_id: id.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&marker)?;
        tokio::fs::write(self.dir.join(ACTIVE_MARKER), bytes).await?;
        Ok(())
    }

    async fn read_active(&self) -> Option<String> {
        let bytes = tokio::fs::read(self.dir.join(ACTIVE_MARKER)).await.ok()?;
        serde_json::from_slice::<ActiveMarker>(&bytes)
            .ok()
            .map(|m| m.session_id)
    }

    async fn clear_active(&self) -> Result<(), SessionStoreError> {
        match tokio::fs::remove_file(self.dir.join(ACTIVE_MARKER)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Remove sensitive fields from a stored record.  Used when a session goes
/// terminal; nothing ever writes them back afterwards.
fn scrub(data: &mut StoredCompanyData) {
    for sh in &mut data.shareholders {
        sh.ssn = None;
    }
    data.payment = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overwrites_only_set_fields() {
        let mut data = CompanyData {
            company_name: Some("Old Name".to_string()),
            state: Some("DE".to_string()),
            ..CompanyData::default()
        };
        CompanyDataPatch {
            company_name: Some("New Name".to_string()),
            ..CompanyDataPatch::default()
        }
        .apply(&mut data);
        assert_eq!(data.company_name.as_deref(), Some("New Name"));
        assert_eq!(data.state.as_deref(), Some("DE"));
    }

    #[test]
    fn scrub_clears_ssn_and_payment() {
        let env = Envelope {
            cipher_text: "x".to_string(),
            iv: "y".to_string(),
            auth_tag: "z".to_string(),
        };
        let mut data = StoredCompanyData {
            shareholders: vec![StoredShareholder {
                name: "A".to_string(),
                ownership_percent: 100.0,
                ssn: Some(env.clone()),
            }],
            payment: Some(StoredPayment {
                last4: "4242".to_string(),
                envelope: env,
            }),
            ..StoredCompanyData::default()
        };
        scrub(&mut data);
        assert!(data.shareholders[0].ssn.is_none());
        assert!(data.payment.is_none());
    }

    #[test]
    fn session_path_rejects_traversal() {
        let store = SessionStore {
            dir: PathBuf::from("/tmp/x"),
            backups_dir: PathBuf::from("/tmp/x/backups"),
            crypto: Arc::new(CryptoService::new("k").unwrap()),
            options: SessionStoreOptions::default(),
        };
        assert!(store.session_path("../evil").is_err());
        assert!(store.session_path("a/b").is_err());
        assert!(store.session_path("").is_err());
        assert!(store.session_path("session-123-abc").is_ok());
    }
}
