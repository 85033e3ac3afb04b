// SPDX-License-Identifier: MIT
//! Certificate review workflow.
//!
//! Composition of the certificate agent client, the local review server, and
//! the browser: generate the certificate, verify the download link has not
//! already expired, serve it for human review, and reduce whatever happens
//! to a tri-state [`ReviewOutcome`].  The server is always stopped on the
//! way out, success or not.
//!
//! The workflow deliberately does not write to the session store — it shapes
//! an [`ApprovedCertificate`] and leaves persistence to the caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::clients::{
    CertificateClient, CertificateRequest, CertificateResponse, CompanyTypePayload,
    RegisteredAgent,
};
use crate::review::{ReviewDecision, ReviewServer, ReviewServerConfig};

// ─── Types ────────────────────────────────────────────────────────────────────

/// Input for one certificate review run.
#[derive(Debug, Clone)]
pub struct CertificateReviewInput {
    pub company_name: String,
    pub state: String,
    pub registered_agent: RegisteredAgent,
    pub company_type: CompanyTypePayload,
}

impl CertificateReviewInput {
    fn validate(&self) -> Result<(), String> {
        if self.company_name.trim().is_empty() {
            return Err("company name must not be empty".to_string());
        }
        if self.state.trim().is_empty() {
            return Err("state must not be empty".to_string());
        }
        if self.registered_agent.name.trim().is_empty() {
            return Err("registered agent name must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CertificateReviewOptions {
    pub review: ReviewServerConfig,
    /// Open the review page in the default browser.  Disabled in tests and
    /// headless environments; the URL is always logged either way.
    pub open_browser: bool,
}

impl Default for CertificateReviewOptions {
    fn default() -> Self {
        Self {
            review: ReviewServerConfig::default(),
            open_browser: true,
        }
    }
}

/// Session-ready record of an approved certificate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedCertificate {
    pub certificate_id: String,
    pub download_url: String,
    pub reviewed_at: DateTime<Utc>,
}

/// Tri-state result of the whole workflow.  Cancellation and timeout are
/// first-class outcomes, not errors; only genuine failures carry a message.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    Approved { certificate: ApprovedCertificate },
    Cancelled,
    Failed { message: String },
}

impl ReviewOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ReviewOutcome::Approved { .. })
    }

    fn failed(message: impl Into<String>) -> Self {
        ReviewOutcome::Failed {
            message: message.into(),
        }
    }
}

// ─── Workflow ─────────────────────────────────────────────────────────────────

/// Run the full certificate review flow.
///
/// The review server is stopped unconditionally before returning; if an
/// early failure meant it never started, the stop is a no-op.
pub async fn run_certificate_review(
    certificates: &CertificateClient,
    input: &CertificateReviewInput,
    options: &CertificateReviewOptions,
) -> ReviewOutcome {
    if let Err(msg) = input.validate() {
        return ReviewOutcome::failed(msg);
    }

    let request = CertificateRequest {
        company_name: input.company_name.clone(),
        state: input.state.clone(),
        registered_agent: input.registered_agent.clone(),
        company_type: input.company_type.clone(),
    };
    let idempotency_key = format!("cert-{}", Uuid::new_v4());
    let certificate = match certificates.generate(&request, &idempotency_key).await {
        Ok(c) => c,
        Err(e) => return ReviewOutcome::failed(format!("certificate generation failed: {e}")),
    };

    let now = Utc::now();
    if certificate.expires_at <= now {
        return ReviewOutcome::failed(format!(
            "certificate download link expired at {} — request a fresh one",
            certificate.expires_at.to_rfc3339()
        ));
    }
    let remaining = certificate.expires_at - now;
    if remaining.to_std().unwrap_or_default() < options.review.timeout {
        warn!(
            expires_at = %certificate.expires_at.to_rfc3339(),
            "certificate link may expire before the review window closes"
        );
    }

    let mut server = ReviewServer::new(options.review.clone());
    let outcome = drive_review(&mut server, &certificate, input, options.open_browser).await;
    // Cleanup runs on every path, including errors before the server started.
    server.stop().await;
    outcome
}

async fn drive_review(
    server: &mut ReviewServer,
    certificate: &CertificateResponse,
    input: &CertificateReviewInput,
    open_browser: bool,
) -> ReviewOutcome {
    if let Err(e) = server
        .start(&certificate.download_url, &input.company_name)
        .await
    {
        return ReviewOutcome::failed(format!("could not start review server: {e}"));
    }
    let url = match server.url() {
        Ok(url) => url,
        Err(e) => return ReviewOutcome::failed(format!("review server has no url: {e}")),
    };

    info!(%url, company = %input.company_name, "certificate ready for review");
    if open_browser {
        if let Err(e) = open::that(&url) {
            // Not fatal: the user can paste the logged URL themselves.
            warn!(err = %e, %url, "could not open browser — open the review page manually");
        }
    }

    match server.wait_for_decision().await {
        Ok(ReviewDecision::Approved) => ReviewOutcome::Approved {
            certificate: ApprovedCertificate {
                certificate_id: certificate.certificate_id.clone(),
                download_url: certificate.download_url.clone(),
                reviewed_at: Utc::now(),
            },
        },
        Ok(ReviewDecision::Cancelled) => ReviewOutcome::Cancelled,
        Ok(ReviewDecision::TimedOut) => {
            ReviewOutcome::failed("review window timed out without a decision")
        }
        Ok(ReviewDecision::Errored) | Err(_) => {
            ReviewOutcome::failed("review server failed before a decision was made")
        }
    }
}
