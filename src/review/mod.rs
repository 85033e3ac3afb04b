// SPDX-License-Identifier: MIT
//! Loopback HTTP server for out-of-band document review.
//!
//! The CLI cannot render a PDF, so review happens in a browser: the server
//! serves a single page embedding the generated document plus approve/cancel
//! buttons, and the CLI blocks until the human clicks one (or the review
//! window times out).  Strictly a same-machine IPC channel — the server only
//! ever binds 127.0.0.1.
//!
//! Each instance is single-shot: one review per server, exactly one terminal
//! decision per instance.  Concurrent reviews get concurrent instances; the
//! sequential port fallback keeps them from colliding.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

/// How many sequential ports to try after the preferred one.
const PORT_FALLBACK_ATTEMPTS: u16 = 10;

/// Delay between answering an approve/cancel request and shutting the
/// server down, so the HTTP response is flushed before the socket closes.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

// ─── Types ────────────────────────────────────────────────────────────────────

/// Terminal outcome of one review.  Exactly one is ever observed per server
/// instance; whichever fires first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    Cancelled,
    TimedOut,
    Errored,
}

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("review server is already running")]
    AlreadyRunning,

    #[error("review server is not running")]
    NotRunning,

    #[error("no free port found after {attempts} attempts starting at {start}")]
    PortExhausted { start: u16, attempts: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ReviewServerConfig {
    /// First port to try; fallback probes the next few sequentially.
    pub preferred_port: u16,
    /// Wall-clock limit on the whole review window.
    pub timeout: Duration,
}

impl Default for ReviewServerConfig {
    fn default() -> Self {
        Self {
            preferred_port: 7463,
            timeout: Duration::from_secs(600),
        }
    }
}

// ─── Server ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct ServerState {
    page: Arc<String>,
    decision_tx: mpsc::Sender<ReviewDecision>,
    shutdown: Arc<Notify>,
}

struct Running {
    port: u16,
    decision_rx: mpsc::Receiver<ReviewDecision>,
    shutdown: Arc<Notify>,
    server_task: tokio::task::JoinHandle<()>,
    timeout_task: tokio::task::JoinHandle<()>,
}

/// Single-shot local review server.
pub struct ReviewServer {
    config: ReviewServerConfig,
    running: Option<Running>,
}

impl ReviewServer {
    pub fn new(config: ReviewServerConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    /// Bind a loopback port and start serving the review page for
    /// `document_url`, labeled with `label` (typically the company name —
    /// user-supplied, so it is HTML-escaped into the page).
    pub async fn start(&mut self, document_url: &str, label: &str) -> Result<(), ReviewError> {
        if self.running.is_some() {
            return Err(ReviewError::AlreadyRunning);
        }

        let listener = self.bind_with_fallback().await?;
        let port = listener.local_addr()?.port();

        // Capacity-1 channel + try_send: the first terminal event wins and
        // every later one is a no-op.
        let (decision_tx, decision_rx) = mpsc::channel(1);
        // Single graceful-shutdown waiter; signalled via notify_one so a
        // stop() racing ahead of the server task's first poll still lands.
        let shutdown = Arc::new(Notify::new());

        let state = ServerState {
            page: Arc::new(render_page(document_url, label)),
            decision_tx: decision_tx.clone(),
            shutdown: Arc::clone(&shutdown),
        };
        let router = Router::new()
            .route("/", get(review_page))
            .route("/index.html", get(review_page))
            .route("/approve", post(approve))
            .route("/cancel", post(cancel))
            .fallback(not_found)
            // Wrong method on a known path is 404 too, not 405.
            .method_not_allowed_fallback(not_found)
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .with_state(state);

        let serve_shutdown = Arc::clone(&shutdown);
        let serve_tx = decision_tx.clone();
        let server_task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { serve_shutdown.notified().await })
                .await;
            if let Err(e) = result {
                warn!(err = %e, "review server failed");
                let _ = serve_tx.try_send(ReviewDecision::Errored);
            }
        });

        let timeout = self.config.timeout;
        let timeout_shutdown = Arc::clone(&shutdown);
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if decision_tx.try_send(ReviewDecision::TimedOut).is_ok() {
                info!("review window expired without a decision");
            }
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            timeout_shutdown.notify_one();
        });

        info!(port, "review server listening on http://127.0.0.1:{port}");
        self.running = Some(Running {
            port,
            decision_rx,
            shutdown,
            server_task,
            timeout_task,
        });
        Ok(())
    }

    async fn bind_with_fallback(&self) -> Result<TcpListener, ReviewError> {
        let start = self.config.preferred_port;
        for offset in 0..PORT_FALLBACK_ATTEMPTS {
            let port = start.saturating_add(offset);
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => debug!(port, err = %e, "port unavailable — trying next"),
            }
        }
        Err(ReviewError::PortExhausted {
            start,
            attempts: PORT_FALLBACK_ATTEMPTS,
        })
    }

    /// The URL a browser should open.  Fails while the server is not running.
    pub fn url(&self) -> Result<String, ReviewError> {
        match &self.running {
            Some(r) => Ok(format!("http://127.0.0.1:{}/", r.port)),
            None => Err(ReviewError::NotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Block until the single terminal decision arrives.
    ///
    /// A closed channel without a decision (server crashed) reports
    /// [`ReviewDecision::Errored`] — callers treat it like a timeout.
    pub async fn wait_for_decision(&mut self) -> Result<ReviewDecision, ReviewError> {
        let running = self.running.as_mut().ok_or(ReviewError::NotRunning)?;
        let decision = running
            .decision_rx
            .recv()
            .await
            .unwrap_or(ReviewDecision::Errored);
        debug!(?decision, "review decision received");
        Ok(decision)
    }

    /// Stop the server.  Idempotent: stopping an already-stopped server is a
    /// no-op.  Clears the review-window timer.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.timeout_task.abort();
        running.shutdown.notify_one();
        // Bounded wait: a wedged connection must not hang the CLI.
        if tokio::time::timeout(Duration::from_secs(2), running.server_task)
            .await
            .is_err()
        {
            warn!("review server did not shut down within 2s");
        }
        debug!("review server stopped");
    }
}

impl Drop for ReviewServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.timeout_task.abort();
            running.shutdown.notify_one();
            running.server_task.abort();
        }
    }
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

async fn review_page(State(state): State<ServerState>) -> impl IntoResponse {
    (
        [
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
            (header::PRAGMA, "no-cache"),
        ],
        Html(state.page.as_ref().clone()),
    )
}

async fn approve(State(state): State<ServerState>) -> impl IntoResponse {
    resolve(state, ReviewDecision::Approved);
    Json(serde_json::json!({ "success": true, "message": "Approved" }))
}

async fn cancel(State(state): State<ServerState>) -> impl IntoResponse {
    resolve(state, ReviewDecision::Cancelled);
    Json(serde_json::json!({ "success": true, "message": "Cancelled" }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

/// Record the decision (first one wins) and schedule shutdown after the
/// grace delay so the HTTP response is flushed before the socket closes.
fn resolve(state: ServerState, decision: ReviewDecision) {
    tokio::spawn(async move {
        let _ = state.decision_tx.try_send(decision);
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        state.shutdown.notify_one();
    });
}

// ─── Page rendering ───────────────────────────────────────────────────────────

/// Minimal entity escaping for values injected into the page.  The label is
/// user-supplied (company name), the URL comes from a remote agent — neither
/// is trusted.
fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_page(document_url: &str, label: &str) -> String {
    let url = html_escape(document_url);
    let label = html_escape(label);
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Review — {label}</title>
<style>
  body {{ font-family: system-ui, sans-serif; margin: 0; display: flex; flex-direction: column; height: 100vh; }}
  header {{ padding: 12px 20px; border-bottom: 1px solid #ddd; display: flex; justify-content: space-between; align-items: center; }}
  iframe {{ flex: 1; border: 0; width: 100%; }}
  button {{ padding: 8px 20px; margin-left: 8px; font-size: 15px; cursor: pointer; border-radius: 4px; border: 1px solid #888; }}
  #approve {{ background: #1a7f37; color: #fff; border-color: #1a7f37; }}
  #status {{ color: #555; }}
</style>
</head>
<body>
<header>
  <div><strong>{label}</strong> — review the generated certificate</div>
  <div>
    <span id="status"></span>
    <button id="cancel">Cancel</button>
    <button id="approve">Approve</button>
  </div>
</header>
<iframe src="{url}" title="Document preview"></iframe>
<script>
  function act(path, done) {{
    fetch(path, {{ method: 'POST' }})
      .then(function () {{
        document.getElementById('status').textContent = done;
        document.getElementById('approve').disabled = true;
        document.getElementById('cancel').disabled = true;
      }})
      .catch(function () {{
        document.getElementById('status').textContent = 'Request failed — is the CLI still running?';
      }});
  }}
  document.getElementById('approve').addEventListener('click', function () {{ act('/approve', 'Approved — you can close this tab.'); }});
  document.getElementById('cancel').addEventListener('click', function () {{ act('/cancel', 'Cancelled — you can close this tab.'); }});
</script>
</body>
</html>
"#
    )
}
