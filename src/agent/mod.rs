// SPDX-License-Identifier: MIT
//! Resilient HTTP execution for the external formation agents.
//!
//! Every remote agent (name-check, document-filler, filing, payment,
//! certificate) talks through one [`AgentExecutor`]: a shared request
//! executor providing uniform timeout, retry-with-backoff, error
//! normalization, and health probing.  Concrete clients in [`clients`] hold
//! an executor by composition and expose typed endpoint functions.
//!
//! # Example
//! ```rust,ignore
//! let exec = Arc::new(AgentExecutor::new("filing", "https://filing.example", None, None, policy)?);
//! let receipt: FilingReceipt = exec.post("/filings", &req, RequestOptions::default()).await?;
//! ```

pub mod clients;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

/// Header carrying the idempotency key.  Stable across retries of one
/// logical call so the remote side can dedupe replayed POSTs.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Fixed timeout for health probes, independent of the per-call timeout.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A successful probe slower than this reports [`HealthStatus::Degraded`].
const DEGRADED_LATENCY_MS: u64 = 2_000;

/// Default per-request timeout when neither config nor call options set one.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Error codes ──────────────────────────────────────────────────────────────

pub mod codes {
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const CANCELLED: &str = "CANCELLED";
    pub const INVALID_RESPONSE: &str = "INVALID_RESPONSE";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

// ─── AgentError ───────────────────────────────────────────────────────────────

/// Normalized error shape for everything that goes wrong talking to a remote
/// agent.  Created once at the transport boundary and propagated upward
/// unchanged.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{agent} agent: {message} [{code}]")]
pub struct AgentError {
    pub agent: String,
    pub message: String,
    pub code: String,
    pub retryable: bool,
    pub http_status: Option<u16>,
    pub details: Option<serde_json::Value>,
}

impl AgentError {
    fn new(agent: &str, message: impl Into<String>, code: &str, retryable: bool) -> Self {
        Self {
            agent: agent.to_string(),
            message: message.into(),
            code: code.to_string(),
            retryable,
            http_status: None,
            details: None,
        }
    }

    fn cancelled(agent: &str) -> Self {
        Self::new(agent, "request cancelled by caller", codes::CANCELLED, false)
    }
}

// ─── RetryPolicy ──────────────────────────────────────────────────────────────

/// Retry behavior for one agent client.  Immutable once constructed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the second attempt; multiplied by `multiplier` after
    /// each failure, capped at `max_delay`.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// HTTP status codes that are worth retrying.
    pub retryable_status: HashSet<u16>,
    /// Normalized error codes that are worth retrying beyond the built-in
    /// transport errors.
    pub retryable_codes: HashSet<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let mut retryable_status: HashSet<u16> = (500..=599).collect();
        retryable_status.insert(408);
        retryable_status.insert(429);
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            retryable_status,
            retryable_codes: HashSet::new(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy suitable for quick unit tests (no real waiting).
    pub fn instant() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            ..Self::default()
        }
    }

    /// Create a policy with a single attempt (no retries).
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based attempt that just
    /// failed): `min(initial_delay * multiplier^(attempt-1), max_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_delay.as_millis() as f64 * exp) as u128;
        Duration::from_millis(ms.min(self.max_delay.as_millis()) as u64)
    }

    fn assert_valid(&self) {
        assert!(self.max_attempts > 0, "RetryPolicy.max_attempts must be at least 1");
        assert!(
            self.initial_delay <= self.max_delay || self.max_attempts == 1,
            "RetryPolicy.initial_delay must not exceed max_delay"
        );
        assert!(
            self.multiplier > 1.0 || self.max_attempts == 1,
            "RetryPolicy.multiplier must be greater than 1"
        );
    }
}

// ─── RequestOptions ───────────────────────────────────────────────────────────

/// Per-call overrides for one logical request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the executor's default request timeout.
    pub timeout: Option<Duration>,
    /// Propagated as the `Idempotency-Key` header on every attempt.
    pub idempotency_key: Option<String>,
    /// Bypass retry entirely — used for calls where a stale retried answer
    /// would be wrong (validation, fee quotes).
    pub skip_retry: bool,
    /// External cancellation signal.  When it flips to `true`, the in-flight
    /// request is aborted and any pending backoff sleep is cut short.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl RequestOptions {
    pub fn with_idempotency_key(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            skip_retry: true,
            ..Self::default()
        }
    }
}

// ─── ConnectionHealth ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Online,
    Offline,
    Degraded,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Online => write!(f, "online"),
            HealthStatus::Offline => write!(f, "offline"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Latest known health of one remote agent.  Overwritten on every probe —
/// no history is kept.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub agent: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ConnectionHealth {
    fn unknown(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            status: HealthStatus::Unknown,
            latency_ms: None,
            last_success_at: None,
            last_failure_at: None,
            consecutive_failures: 0,
        }
    }
}

// ─── AgentExecutor ────────────────────────────────────────────────────────────

/// Shared request executor for one named remote agent.
///
/// Owns the HTTP connection pool, the retry policy, and the agent's
/// [`ConnectionHealth`] record.  Cheap to share behind an `Arc`.
pub struct AgentExecutor {
    agent: String,
    base_url: String,
    api_key: Option<String>,
    default_timeout: Duration,
    client: reqwest::Client,
    policy: RetryPolicy,
    health: Arc<RwLock<ConnectionHealth>>,
    probe_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AgentExecutor {
    /// Build an executor for `agent` at `base_url`.
    ///
    /// # Panics
    /// Panics if `policy` violates its invariants (`max_attempts == 0`,
    /// `initial_delay > max_delay`, `multiplier <= 1`).
    pub fn new(
        agent: &str,
        base_url: &str,
        api_key: Option<String>,
        timeout: Option<Duration>,
        policy: RetryPolicy,
    ) -> Result<Self, AgentError> {
        policy.assert_valid();
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::new(agent, e.to_string(), codes::UNKNOWN_ERROR, false))?;
        Ok(Self {
            agent: agent.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_timeout: timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            client,
            policy,
            health: Arc::new(RwLock::new(ConnectionHealth::unknown(agent))),
            probe_task: std::sync::Mutex::new(None),
        })
    }

    pub fn agent_name(&self) -> &str {
        &self.agent
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions,
    ) -> Result<T, AgentError> {
        self.request(Method::GET, path, None, opts).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
        opts: RequestOptions,
    ) -> Result<T, AgentError> {
        let body = self.to_body(body)?;
        self.request(Method::POST, path, Some(body), opts).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
        opts: RequestOptions,
    ) -> Result<T, AgentError> {
        let body = self.to_body(body)?;
        self.request(Method::PUT, path, Some(body), opts).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions,
    ) -> Result<T, AgentError> {
        self.request(Method::DELETE, path, None, opts).await
    }

    fn to_body<B: Serialize>(&self, body: &B) -> Result<serde_json::Value, AgentError> {
        serde_json::to_value(body).map_err(|e| {
            AgentError::new(
                &self.agent,
                format!("failed to serialize request body: {e}"),
                codes::UNKNOWN_ERROR,
                false,
            )
        })
    }

    /// Execute one logical request through the retry loop.
    ///
    /// Attempts are strictly sequential.  Non-retryable failures and the
    /// final attempt surface the normalized [`AgentError`] immediately.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        opts: RequestOptions,
    ) -> Result<T, AgentError> {
        let max_attempts = if opts.skip_retry { 1 } else { self.policy.max_attempts };
        let url = format!("{}{}", self.base_url, path);

        let mut last_err: Option<AgentError> = None;
        for attempt in 1..=max_attempts {
            if is_cancelled(&opts.cancel) {
                return Err(AgentError::cancelled(&self.agent));
            }

            match self.attempt(&method, &url, body.as_ref(), &opts).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(agent = %self.agent, attempt, "retry succeeded");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if err.code == codes::CANCELLED {
                        return Err(err);
                    }
                    if !err.retryable || attempt == max_attempts {
                        if err.retryable {
                            warn!(
                                agent = %self.agent,
                                attempt,
                                max = max_attempts,
                                code = %err.code,
                                "all retry attempts exhausted"
                            );
                        }
                        return Err(err);
                    }
                    let delay = self.policy.backoff_delay(attempt);
                    warn!(
                        agent = %self.agent,
                        attempt,
                        max = max_attempts,
                        delay_ms = delay.as_millis(),
                        code = %err.code,
                        "attempt failed — retrying"
                    );
                    last_err = Some(err);
                    if !sleep_unless_cancelled(delay, &opts.cancel).await {
                        return Err(AgentError::cancelled(&self.agent));
                    }
                }
            }
        }

        // Unreachable: the loop always returns.  Kept for totality.
        Err(last_err.unwrap_or_else(|| {
            AgentError::new(&self.agent, "retry loop ended unexpectedly", codes::UNKNOWN_ERROR, false)
        }))
    }

    /// One attempt: build, send, and normalize.
    async fn attempt<T: DeserializeOwned>(
        &self,
        method: &Method,
        url: &str,
        body: Option<&serde_json::Value>,
        opts: &RequestOptions,
    ) -> Result<T, AgentError> {
        let mut req = self
            .client
            .request(method.clone(), url)
            .timeout(opts.timeout.unwrap_or(self.default_timeout));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        // The idempotency key must be byte-identical on every attempt.
        if let Some(key) = &opts.idempotency_key {
            req = req.header(IDEMPOTENCY_HEADER, key);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let send = req.send();
        let resp = match &opts.cancel {
            Some(rx) => {
                let mut rx = rx.clone();
                tokio::select! {
                    resp = send => resp,
                    _ = wait_cancelled(&mut rx) => {
                        return Err(AgentError::cancelled(&self.agent));
                    }
                }
            }
            None => send.await,
        };

        let resp = resp.map_err(|e| self.normalize_transport(e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(self.normalize_http(status.as_u16(), resp.text().await.ok()));
        }

        resp.json::<T>().await.map_err(|e| {
            AgentError::new(
                &self.agent,
                format!("invalid response body: {e}"),
                codes::INVALID_RESPONSE,
                false,
            )
        })
    }

    /// Normalize a transport-level failure.  Timeouts and network errors are
    /// always retryable; anything else is retryable only if its code is in
    /// the policy's `retryable_codes`.
    fn normalize_transport(&self, err: reqwest::Error) -> AgentError {
        let (code, retryable) = if err.is_timeout() {
            (codes::TIMEOUT, true)
        } else if err.is_connect() || err.is_request() {
            (codes::NETWORK_ERROR, true)
        } else {
            (codes::UNKNOWN_ERROR, false)
        };
        let retryable = retryable || self.policy.retryable_codes.contains(code);
        AgentError::new(&self.agent, err.to_string(), code, retryable)
    }

    /// Normalize a non-2xx HTTP response.  Retryable only when the status is
    /// in the policy's `retryable_status` set.
    fn normalize_http(&self, status: u16, body: Option<String>) -> AgentError {
        let code = format!("HTTP_{status}");
        let retryable = self.policy.retryable_status.contains(&status)
            || self.policy.retryable_codes.contains(&code);
        let details = body
            .as_deref()
            .and_then(|b| serde_json::from_str::<serde_json::Value>(b).ok());
        AgentError {
            agent: self.agent.clone(),
            message: format!("request failed with status {status}"),
            code,
            retryable,
            http_status: Some(status),
            details,
        }
    }

    // ─── Health ───────────────────────────────────────────────────────────────

    /// Probe the agent's `/health` endpoint once and update the stored
    /// [`ConnectionHealth`].  Never retried; uses a fixed short timeout.
    pub async fn check_health(&self) -> ConnectionHealth {
        probe_once(&self.client, &self.agent, &self.base_url, &self.health).await
    }

    /// Snapshot of the last known health without probing.
    pub async fn health(&self) -> ConnectionHealth {
        self.health.read().await.clone()
    }

    /// Start periodic background probing.  Idempotent: a second call while a
    /// probe task is alive is a no-op.
    pub fn start_health_checks(&self, interval: Duration) {
        let mut guard = self.probe_task.lock().expect("probe task lock poisoned");
        if guard.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let client = self.client.clone();
        let agent = self.agent.clone();
        let base_url = self.base_url.clone();
        let health = Arc::clone(&self.health);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let h = probe_once(&client, &agent, &base_url, &health).await;
                debug!(agent = %agent, status = %h.status, "periodic health probe");
            }
        }));
    }

    /// Stop periodic probing.  Idempotent.
    pub fn stop_health_checks(&self) {
        if let Some(task) = self.probe_task.lock().expect("probe task lock poisoned").take() {
            task.abort();
        }
    }
}

impl Drop for AgentExecutor {
    fn drop(&mut self) {
        self.stop_health_checks();
    }
}

async fn probe_once(
    client: &reqwest::Client,
    agent: &str,
    base_url: &str,
    slot: &RwLock<ConnectionHealth>,
) -> ConnectionHealth {
    let start = std::time::Instant::now();
    let result = client
        .get(format!("{base_url}/health"))
        .timeout(HEALTH_PROBE_TIMEOUT)
        .send()
        .await
        .and_then(|r| r.error_for_status());
    let latency_ms = start.elapsed().as_millis() as u64;

    let mut health = slot.write().await;
    match result {
        Ok(_) => {
            health.status = status_for_latency(latency_ms);
            health.latency_ms = Some(latency_ms);
            health.last_success_at = Some(Utc::now());
            health.consecutive_failures = 0;
        }
        Err(e) => {
            debug!(agent, err = %e, "health probe failed");
            health.status = HealthStatus::Offline;
            health.latency_ms = None;
            health.last_failure_at = Some(Utc::now());
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        }
    }
    health.clone()
}

/// Classify a successful probe by its observed latency.
fn status_for_latency(latency_ms: u64) -> HealthStatus {
    if latency_ms > DEGRADED_LATENCY_MS {
        HealthStatus::Degraded
    } else {
        HealthStatus::Online
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Wait until the cancel signal flips to `true`.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            // Sender dropped without cancelling: never resolve.
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep for `delay`, returning `false` if cancelled first.
async fn sleep_unless_cancelled(delay: Duration, cancel: &Option<watch::Receiver<bool>>) -> bool {
    match cancel {
        Some(rx) => {
            let mut rx = rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = wait_cancelled(&mut rx) => false,
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_follows_exponential_curve() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(800));
        // Capped at max_delay.
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(1_000));
    }

    #[test]
    fn default_policy_retries_408_429_and_5xx() {
        let policy = RetryPolicy::default();
        assert!(policy.retryable_status.contains(&408));
        assert!(policy.retryable_status.contains(&429));
        assert!(policy.retryable_status.contains(&500));
        assert!(policy.retryable_status.contains(&503));
        assert!(!policy.retryable_status.contains(&400));
        assert!(!policy.retryable_status.contains(&404));
    }

    #[test]
    #[should_panic(expected = "max_attempts")]
    fn zero_attempts_policy_is_rejected() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        policy.assert_valid();
    }

    #[test]
    #[should_panic(expected = "initial_delay")]
    fn inverted_delay_bounds_are_rejected() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(30),
            ..RetryPolicy::default()
        };
        policy.assert_valid();
    }

    #[tokio::test]
    async fn executor_normalizes_http_status() {
        let exec = AgentExecutor::new(
            "test",
            "http://127.0.0.1:9",
            None,
            None,
            RetryPolicy::instant(),
        )
        .unwrap();
        let err = exec.normalize_http(503, Some(r#"{"reason":"maintenance"}"#.to_string()));
        assert_eq!(err.code, "HTTP_503");
        assert!(err.retryable);
        assert_eq!(err.http_status, Some(503));
        assert_eq!(err.details.unwrap()["reason"], "maintenance");

        let err = exec.normalize_http(400, None);
        assert_eq!(err.code, "HTTP_400");
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn extra_retryable_codes_extend_classification() {
        let mut policy = RetryPolicy::instant();
        policy.retryable_codes.insert("HTTP_409".to_string());
        let exec = AgentExecutor::new("test", "http://127.0.0.1:9", None, None, policy).unwrap();
        assert!(exec.normalize_http(409, None).retryable);
    }

    #[test]
    fn slow_probes_report_degraded() {
        assert_eq!(status_for_latency(0), HealthStatus::Online);
        assert_eq!(
            status_for_latency(DEGRADED_LATENCY_MS),
            HealthStatus::Online
        );
        assert_eq!(
            status_for_latency(DEGRADED_LATENCY_MS + 1),
            HealthStatus::Degraded
        );
    }

    #[tokio::test]
    async fn health_starts_unknown() {
        let exec = AgentExecutor::new(
            "fresh",
            "http://127.0.0.1:9",
            None,
            None,
            RetryPolicy::no_retry(),
        )
        .unwrap();
        let h = exec.health().await;
        assert_eq!(h.status, HealthStatus::Unknown);
        assert_eq!(h.consecutive_failures, 0);
        assert!(h.last_success_at.is_none());
    }

    #[tokio::test]
    async fn start_health_checks_is_idempotent() {
        let exec = AgentExecutor::new(
            "probe",
            "http://127.0.0.1:9",
            None,
            None,
            RetryPolicy::no_retry(),
        )
        .unwrap();
        exec.start_health_checks(Duration::from_secs(3600));
        exec.start_health_checks(Duration::from_secs(3600));
        exec.stop_health_checks();
        exec.stop_health_checks();
    }
}
