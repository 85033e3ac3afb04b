// SPDX-License-Identifier: MIT
//! Configuration: `config.toml` in the data dir plus CLI/env overrides.
//!
//! Every section is optional and individually defaulted, so a missing or
//! partial file still yields a usable config.  The one hard requirement is
//! the encryption passphrase: there is no built-in default key, a missing
//! passphrase is a startup error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::{AgentExecutor, RetryPolicy};
use crate::review::ReviewServerConfig;
use crate::session::SessionStoreOptions;

const CONFIG_FILE: &str = "config.toml";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_REVIEW_PORT: u16 = 7463;
const DEFAULT_REVIEW_TIMEOUT_MINUTES: u64 = 10;
const DEFAULT_SESSION_RETENTION_DAYS: u64 = 30;
const DEFAULT_BACKUP_RETENTION_DAYS: u64 = 7;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// No passphrase in the environment, CLI, or config file.  Deliberately
    /// not a warn-and-continue with a default key.
    #[error(
        "no encryption passphrase configured — set INCORP_PASSPHRASE or \
         [encryption].passphrase in config.toml"
    )]
    MissingPassphrase,

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ─── Sections ─────────────────────────────────────────────────────────────────

/// Retry tuning for one agent (`[agents.<name>.retry]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            ..RetryPolicy::default()
        }
    }
}

/// One remote agent endpoint (`[agents.name_check]` etc.).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub retry: RetrySection,
    /// Enable periodic background health probes at this interval.
    pub health_interval_secs: Option<u64>,
}

impl Default for AgentEndpoint {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry: RetrySection::default(),
            health_interval_secs: None,
        }
    }
}

impl AgentEndpoint {
    fn with_default_url(url: &str) -> Self {
        Self {
            base_url: url.to_string(),
            ..Self::default()
        }
    }

    /// Build an executor from this endpoint config.
    pub fn build_executor(&self, agent: &str) -> Result<AgentExecutor, ConfigError> {
        if self.base_url.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "agents.{agent}.base_url must be set"
            )));
        }
        let exec = AgentExecutor::new(
            agent,
            &self.base_url,
            self.api_key.clone(),
            Some(Duration::from_secs(self.timeout_secs)),
            self.retry.to_policy(),
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if let Some(secs) = self.health_interval_secs {
            exec.start_health_checks(Duration::from_secs(secs));
        }
        Ok(exec)
    }
}

/// `[agents]`: one endpoint per remote formation agent.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub name_check: AgentEndpoint,
    pub document_filler: AgentEndpoint,
    pub filing: AgentEndpoint,
    pub payment: AgentEndpoint,
    pub certificate: AgentEndpoint,
}

impl AgentsConfig {
    fn dev_defaults() -> Self {
        Self {
            name_check: AgentEndpoint::with_default_url("http://localhost:4101"),
            document_filler: AgentEndpoint::with_default_url("http://localhost:4102"),
            filing: AgentEndpoint::with_default_url("http://localhost:4103"),
            payment: AgentEndpoint::with_default_url("http://localhost:4104"),
            certificate: AgentEndpoint::with_default_url("http://localhost:4105"),
        }
    }
}

/// `[review]`: local review server tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub preferred_port: u16,
    pub timeout_minutes: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            preferred_port: DEFAULT_REVIEW_PORT,
            timeout_minutes: DEFAULT_REVIEW_TIMEOUT_MINUTES,
        }
    }
}

impl ReviewConfig {
    pub fn to_server_config(&self) -> ReviewServerConfig {
        ReviewServerConfig {
            preferred_port: self.preferred_port,
            timeout: Duration::from_secs(self.timeout_minutes * 60),
        }
    }
}

/// `[storage]`: session persistence tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backups_enabled: bool,
    pub session_retention_days: u64,
    pub backup_retention_days: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backups_enabled: true,
            session_retention_days: DEFAULT_SESSION_RETENTION_DAYS,
            backup_retention_days: DEFAULT_BACKUP_RETENTION_DAYS,
        }
    }
}

impl StorageConfig {
    pub fn to_store_options(&self) -> SessionStoreOptions {
        SessionStoreOptions {
            backups_enabled: self.backups_enabled,
            session_retention: Duration::from_secs(self.session_retention_days * 24 * 3600),
            backup_retention: Duration::from_secs(self.backup_retention_days * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct EncryptionSection {
    passphrase: Option<String>,
}

/// Raw `config.toml` shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    encryption: EncryptionSection,
    storage: StorageConfig,
    review: ReviewConfig,
    agents: Option<AgentsConfig>,
}

// ─── AppConfig ────────────────────────────────────────────────────────────────

/// Fully-resolved application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub encryption_passphrase: String,
    pub storage: StorageConfig,
    pub review: ReviewConfig,
    pub agents: AgentsConfig,
}

impl AppConfig {
    /// Load `config.toml` from `data_dir` (absent file = all defaults) and
    /// apply overrides.  `passphrase_override` (CLI/env) wins over the file.
    pub fn load(
        data_dir: impl Into<PathBuf>,
        passphrase_override: Option<String>,
    ) -> Result<Self, ConfigError> {
        let data_dir = data_dir.into();
        let path = data_dir.join(CONFIG_FILE);
        let file: ConfigFile = if path.exists() {
            toml::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            ConfigFile::default()
        };

        let encryption_passphrase = passphrase_override
            .filter(|p| !p.is_empty())
            .or(file.encryption.passphrase)
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::MissingPassphrase)?;

        Ok(Self {
            data_dir,
            encryption_passphrase,
            storage: file.storage,
            review: file.review,
            agents: file.agents.unwrap_or_else(AgentsConfig::dev_defaults),
        })
    }

    /// Directory holding session files.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}

pub fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| Path::new(&home).join(".local/share/incorp"))
        .unwrap_or_else(|| PathBuf::from(".incorp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_passphrase_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(dir.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPassphrase));
    }

    #[test]
    fn override_beats_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[encryption]\npassphrase = \"from-file\"\n",
        )
        .unwrap();
        let cfg = AppConfig::load(dir.path(), Some("from-env".to_string())).unwrap();
        assert_eq!(cfg.encryption_passphrase, "from-env");

        let cfg = AppConfig::load(dir.path(), None).unwrap();
        assert_eq!(cfg.encryption_passphrase, "from-file");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
[encryption]
passphrase = "k"

[storage]
backups_enabled = false

[agents.certificate]
base_url = "https://certs.example"
timeout_secs = 10
"#,
        )
        .unwrap();
        let cfg = AppConfig::load(dir.path(), None).unwrap();
        assert!(!cfg.storage.backups_enabled);
        assert_eq!(cfg.storage.session_retention_days, 30);
        assert_eq!(cfg.review.preferred_port, 7463);
        assert_eq!(cfg.agents.certificate.base_url, "https://certs.example");
        assert_eq!(cfg.agents.certificate.timeout_secs, 10);
        // Sections not present in the file keep their (empty) defaults.
        assert!(cfg.agents.filing.base_url.is_empty());
    }

    #[test]
    fn empty_base_url_fails_executor_build() {
        let endpoint = AgentEndpoint::default();
        assert!(matches!(
            endpoint.build_executor("filing"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn retry_section_maps_to_policy() {
        let section = RetrySection {
            max_attempts: 5,
            initial_delay_ms: 250,
            max_delay_ms: 4_000,
            multiplier: 3.0,
        };
        let policy = section.to_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_millis(4_000));
        // Default retryable statuses survive the mapping.
        assert!(policy.retryable_status.contains(&503));
    }
}
