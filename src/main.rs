// SPDX-License-Identifier: MIT
use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use incorp::agent::clients::{CertificateClient, CompanyTypePayload, RegisteredAgent};
use incorp::config::{default_data_dir, AppConfig};
use incorp::crypto::CryptoService;
use incorp::session::{SessionQuery, SessionStatus, SessionStore};
use incorp::workflow::{
    run_certificate_review, CertificateReviewInput, CertificateReviewOptions, ReviewOutcome,
};

#[derive(Parser)]
#[command(
    name = "incorp",
    about = "Interactive US company formation assistant",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Data directory for sessions, backups, and config.toml
    #[arg(long, env = "INCORP_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Encryption passphrase for session data at rest
    #[arg(long, env = "INCORP_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "INCORP_LOG")]
    log: Option<String>,

    /// Suppress informational output.
    ///
    /// Errors are still printed to stderr. Use this flag when piping output
    /// to other tools.
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Manage formation sessions.
    ///
    /// Sessions are encrypted at rest; listing never decrypts.
    ///
    /// Examples:
    ///   incorp sessions list
    ///   incorp sessions list --status in-progress
    ///   incorp sessions resume
    ///   incorp sessions delete session-1712000000000-a1b2c3d4
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Manage session backups.
    ///
    /// Examples:
    ///   incorp backups list
    ///   incorp backups restore backup-1712000000000-a1b2c3d4
    Backups {
        #[command(subcommand)]
        action: BackupsAction,
    },
    /// Probe the configured remote agents and print their health.
    ///
    /// Exit code 0 if every configured agent is online, 1 otherwise.
    ///
    /// Examples:
    ///   incorp agents health
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
    /// Generate a certificate and review it in the browser.
    ///
    /// Blocks until the certificate is approved, cancelled, or the review
    /// window times out.
    ///
    /// Examples:
    ///   incorp review --company "Acme LLC" --state DE \
    ///       --agent-name "Agents Inc" --agent-address "2 State St"
    Review {
        /// Company name as it should appear on the certificate
        #[arg(long = "company")]
        company_name: String,
        /// Formation state (two-letter code)
        #[arg(long)]
        state: String,
        /// Registered agent name
        #[arg(long)]
        agent_name: String,
        /// Registered agent street address
        #[arg(long)]
        agent_address: String,
        /// Do not open the browser; print the review URL instead
        #[arg(long)]
        no_browser: bool,
    },
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List sessions, newest first.
    List {
        /// Filter by status: in-progress, completed, abandoned
        #[arg(long)]
        status: Option<String>,
        /// Maximum rows to print
        #[arg(long, short = 'n')]
        limit: Option<usize>,
        /// Output as JSON for scripting
        #[arg(long)]
        json: bool,
    },
    /// Show the session that `resume` would pick up.
    Resume,
    /// Delete terminal sessions and backups past their retention windows.
    Cleanup,
    /// Delete one session file outright.
    Delete { session_id: String },
}

#[derive(Subcommand)]
enum BackupsAction {
    /// List backups, newest first.
    List {
        /// Only backups for this session
        #[arg(long)]
        session: Option<String>,
    },
    /// Restore a session from a backup (checksum-verified).
    Restore { backup_id: String },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// Probe each configured agent once.
    Health {
        /// Output as JSON for scripting
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once, before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .compact()
        .init();

    let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("could not create data dir {}", data_dir.display()))?;
    let config = AppConfig::load(&data_dir, args.passphrase.clone())?;
    let quiet = args.quiet;

    match args.command {
        Command::Sessions { action } => run_sessions(&config, action, quiet).await,
        Command::Backups { action } => run_backups(&config, action, quiet).await,
        Command::Agents { action } => run_agents(&config, action).await,
        Command::Review {
            company_name,
            state,
            agent_name,
            agent_address,
            no_browser,
        } => {
            run_review(
                &config,
                company_name,
                state,
                agent_name,
                agent_address,
                no_browser,
            )
            .await
        }
    }
}

async fn open_store(config: &AppConfig) -> Result<SessionStore> {
    let crypto = Arc::new(CryptoService::new(&config.encryption_passphrase)?);
    let store = SessionStore::new(
        config.sessions_dir(),
        crypto,
        config.storage.to_store_options(),
    )
    .await?;
    Ok(store)
}

fn parse_status(s: &str) -> Result<SessionStatus> {
    match s {
        "in-progress" | "in_progress" => Ok(SessionStatus::InProgress),
        "completed" => Ok(SessionStatus::Completed),
        "abandoned" => Ok(SessionStatus::Abandoned),
        other => anyhow::bail!("unknown status {other:?} (expected in-progress, completed, or abandoned)"),
    }
}

async fn run_sessions(config: &AppConfig, action: SessionsAction, quiet: bool) -> Result<()> {
    let store = open_store(config).await?;
    match action {
        SessionsAction::List {
            status,
            limit,
            json,
        } => {
            let query = SessionQuery {
                status: status.as_deref().map(parse_status).transpose()?,
                limit,
                ..SessionQuery::default()
            };
            let rows = store.list_sessions(&query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                if !quiet {
                    println!("no sessions");
                }
            } else {
                for row in rows {
                    println!(
                        "{}  {:?}  step={}  company={}  updated={}",
                        row.session_id,
                        row.status,
                        row.current_step,
                        row.company_name.as_deref().unwrap_or("-"),
                        row.updated_at.to_rfc3339(),
                    );
                }
            }
        }
        SessionsAction::Resume => match store.resume_session().await? {
            Some(session) => println!(
                "{}  step={}  company={}",
                session.session_id,
                session.current_step,
                session.company_data.company_name.as_deref().unwrap_or("-"),
            ),
            None => {
                if !quiet {
                    println!("no resumable session");
                }
            }
        },
        SessionsAction::Cleanup => {
            let report = store.cleanup_old_sessions().await?;
            if !quiet {
                println!(
                    "deleted {} sessions and {} backups",
                    report.sessions_deleted, report.backups_deleted
                );
            }
        }
        SessionsAction::Delete { session_id } => {
            if store.delete_session(&session_id).await? {
                if !quiet {
                    println!("deleted {session_id}");
                }
            } else {
                eprintln!("no such session: {session_id}");
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn run_backups(config: &AppConfig, action: BackupsAction, quiet: bool) -> Result<()> {
    let store = open_store(config).await?;
    match action {
        BackupsAction::List { session } => {
            let records = store.list_backups(session.as_deref()).await?;
            if records.is_empty() {
                if !quiet {
                    println!("no backups");
                }
            } else {
                for record in records {
                    println!(
                        "{}  session={}  at={}",
                        record.backup_id,
                        record.session_id,
                        record.timestamp.to_rfc3339(),
                    );
                }
            }
        }
        BackupsAction::Restore { backup_id } => {
            let session = store.restore_from_backup(&backup_id).await?;
            if !quiet {
                println!(
                    "restored {} at step {}",
                    session.session_id, session.current_step
                );
            }
        }
    }
    Ok(())
}

async fn run_agents(config: &AppConfig, action: AgentsAction) -> Result<()> {
    let AgentsAction::Health { json } = action;
    let agents = &config.agents;
    let endpoints = [
        ("name_check", &agents.name_check),
        ("document_filler", &agents.document_filler),
        ("filing", &agents.filing),
        ("payment", &agents.payment),
        ("certificate", &agents.certificate),
    ];

    let mut reports = Vec::new();
    let mut all_online = true;
    for (name, endpoint) in endpoints {
        if endpoint.base_url.is_empty() {
            continue;
        }
        let exec = endpoint.build_executor(name)?;
        let health = exec.check_health().await;
        all_online &= health.status == incorp::agent::HealthStatus::Online;
        reports.push(health);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for h in &reports {
            let latency = h
                .latency_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".to_string());
            println!("{:<16} {:<9} latency={}", h.agent, h.status.to_string(), latency);
        }
    }
    std::process::exit(if all_online { 0 } else { 1 });
}

async fn run_review(
    config: &AppConfig,
    company_name: String,
    state: String,
    agent_name: String,
    agent_address: String,
    no_browser: bool,
) -> Result<()> {
    let exec = Arc::new(config.agents.certificate.build_executor("certificate")?);
    let certificates = CertificateClient::new(exec);

    let input = CertificateReviewInput {
        company_name,
        state: state.clone(),
        registered_agent: RegisteredAgent {
            name: agent_name,
            address: agent_address,
            state,
        },
        company_type: CompanyTypePayload::Llc { members: vec![] },
    };
    let options = CertificateReviewOptions {
        review: config.review.to_server_config(),
        open_browser: !no_browser,
    };

    match run_certificate_review(&certificates, &input, &options).await {
        ReviewOutcome::Approved { certificate } => {
            println!(
                "approved: certificate {} ({})",
                certificate.certificate_id, certificate.download_url
            );
            Ok(())
        }
        ReviewOutcome::Cancelled => {
            println!("cancelled by reviewer");
            std::process::exit(2);
        }
        ReviewOutcome::Failed { message } => {
            eprintln!("review failed: {message}");
            std::process::exit(1);
        }
    }
}
