// SPDX-License-Identifier: MIT
//! Typed clients for the five external formation agents.
//!
//! Each client is a thin wrapper holding a shared [`AgentExecutor`] — retry,
//! timeout, and health behavior live in the executor, endpoints live here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{AgentError, AgentExecutor, RequestOptions};

// ─── Shared payload types ─────────────────────────────────────────────────────

/// Company-type-specific slice of a certificate request.
///
/// A tagged union so corporation-only fields (shares, par value,
/// incorporator) cannot appear on an LLC request at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "companyType", rename_all = "camelCase")]
pub enum CompanyTypePayload {
    #[serde(rename = "llc", rename_all = "camelCase")]
    Llc { members: Vec<Member> },
    #[serde(rename = "c_corp", rename_all = "camelCase")]
    CCorp {
        shares_authorized: u64,
        par_value_cents: u64,
        incorporator: Incorporator,
    },
    #[serde(rename = "s_corp", rename_all = "camelCase")]
    SCorp {
        shares_authorized: u64,
        par_value_cents: u64,
        incorporator: Incorporator,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub name: String,
    pub ownership_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incorporator {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredAgent {
    pub name: String,
    pub address: String,
    pub state: String,
}

// ─── Name check ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NameCheckRequest<'a> {
    state: &'a str,
    company_name: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameAvailability {
    pub available: bool,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Client for the name-availability agent.
#[derive(Clone)]
pub struct NameCheckClient {
    exec: Arc<AgentExecutor>,
}

impl NameCheckClient {
    pub fn new(exec: Arc<AgentExecutor>) -> Self {
        Self { exec }
    }

    pub async fn check_availability(
        &self,
        state: &str,
        company_name: &str,
    ) -> Result<NameAvailability, AgentError> {
        self.exec
            .post(
                "/names/check",
                &NameCheckRequest { state, company_name },
                RequestOptions::default(),
            )
            .await
    }
}

// ─── Document filler ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFillRequest {
    pub company_name: String,
    pub state: String,
    pub registered_agent: RegisteredAgent,
    #[serde(flatten)]
    pub company_type: CompanyTypePayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilledDocuments {
    pub document_id: String,
    pub document_url: String,
    #[serde(default)]
    pub page_count: Option<u32>,
}

/// Client for the document-generation agent.
#[derive(Clone)]
pub struct DocumentFillerClient {
    exec: Arc<AgentExecutor>,
}

impl DocumentFillerClient {
    pub fn new(exec: Arc<AgentExecutor>) -> Self {
        Self { exec }
    }

    pub async fn fill_documents(
        &self,
        req: &DocumentFillRequest,
    ) -> Result<FilledDocuments, AgentError> {
        self.exec
            .post("/documents/fill", req, RequestOptions::default())
            .await
    }
}

// ─── Filing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilingRequest {
    pub state: String,
    pub company_name: String,
    pub document_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilingReceipt {
    pub filing_id: String,
    pub status: String,
    #[serde(default)]
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeQuote {
    pub state_fee_cents: u64,
    pub service_fee_cents: u64,
    pub total_cents: u64,
}

/// Client for the state-filing agent.
#[derive(Clone)]
pub struct FilingClient {
    exec: Arc<AgentExecutor>,
}

impl FilingClient {
    pub fn new(exec: Arc<AgentExecutor>) -> Self {
        Self { exec }
    }

    /// Submit a filing.  Callers should pass an idempotency key — the remote
    /// side dedupes retried submissions by it.
    pub async fn submit_filing(
        &self,
        req: &FilingRequest,
        idempotency_key: &str,
    ) -> Result<FilingReceipt, AgentError> {
        self.exec
            .post(
                "/filings",
                req,
                RequestOptions::with_idempotency_key(idempotency_key),
            )
            .await
    }

    /// Fee quotes are never retried: a stale quote retried seconds later
    /// could silently disagree with the one the user approved.
    pub async fn calculate_fees(
        &self,
        state: &str,
        company_type: &str,
    ) -> Result<FeeQuote, AgentError> {
        self.exec
            .get(
                &format!("/fees/{state}/{company_type}"),
                RequestOptions::no_retry(),
            )
            .await
    }
}

// ─── Payment ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeRequest {
    pub amount_cents: u64,
    pub currency: String,
    /// Opaque token from the payment provider — never raw card data.
    pub payment_token: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeConfirmation {
    pub charge_id: String,
    pub status: String,
    pub receipt_url: Option<String>,
}

/// Client for the payment agent.
#[derive(Clone)]
pub struct PaymentClient {
    exec: Arc<AgentExecutor>,
}

impl PaymentClient {
    pub fn new(exec: Arc<AgentExecutor>) -> Self {
        Self { exec }
    }

    /// Charge the customer.  The idempotency key is mandatory here — a
    /// retried charge without one could bill twice.
    pub async fn charge(
        &self,
        req: &ChargeRequest,
        idempotency_key: &str,
    ) -> Result<ChargeConfirmation, AgentError> {
        self.exec
            .post(
                "/charges",
                req,
                RequestOptions::with_idempotency_key(idempotency_key),
            )
            .await
    }
}

// ─── Certificate ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest {
    pub company_name: String,
    pub state: String,
    pub registered_agent: RegisteredAgent,
    #[serde(flatten)]
    pub company_type: CompanyTypePayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateResponse {
    pub certificate_id: String,
    pub download_url: String,
    /// The download link expires; the review workflow refuses links that are
    /// already expired on arrival.
    pub expires_at: DateTime<Utc>,
}

/// Client for the certificate-generation agent.
#[derive(Clone)]
pub struct CertificateClient {
    exec: Arc<AgentExecutor>,
}

impl CertificateClient {
    pub fn new(exec: Arc<AgentExecutor>) -> Self {
        Self { exec }
    }

    pub async fn generate(
        &self,
        req: &CertificateRequest,
        idempotency_key: &str,
    ) -> Result<CertificateResponse, AgentError> {
        self.exec
            .post(
                "/certificates",
                req,
                RequestOptions::with_idempotency_key(idempotency_key),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llc_payload_carries_no_corporation_fields() {
        let payload = CompanyTypePayload::Llc {
            members: vec![Member {
                name: "Jordan".to_string(),
                ownership_percent: 100.0,
            }],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["companyType"], "llc");
        assert!(json.get("sharesAuthorized").is_none());
        assert!(json.get("incorporator").is_none());
    }

    #[test]
    fn corporation_payload_carries_share_structure() {
        let payload = CompanyTypePayload::CCorp {
            shares_authorized: 10_000_000,
            par_value_cents: 1,
            incorporator: Incorporator {
                name: "Jordan".to_string(),
                address: "1 Main St".to_string(),
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["companyType"], "c_corp");
        assert_eq!(json["sharesAuthorized"], 10_000_000);
        assert!(json.get("members").is_none());
    }

    #[test]
    fn certificate_request_flattens_company_type() {
        let req = CertificateRequest {
            company_name: "Acme LLC".to_string(),
            state: "DE".to_string(),
            registered_agent: RegisteredAgent {
                name: "Agents Inc".to_string(),
                address: "2 State St".to_string(),
                state: "DE".to_string(),
            },
            company_type: CompanyTypePayload::Llc { members: vec![] },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["companyType"], "llc");
        assert_eq!(json["companyName"], "Acme LLC");
    }
}
