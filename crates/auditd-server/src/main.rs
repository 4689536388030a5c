//! auditd: centralized governance daemon
//!
//! Single authority for the tamper-evident audit chain, the human-in-the-loop
//! approval workflow and policy enforcement. Thin wiring over the library
//! crates: parse flags, open stores, assemble the router, start workers,
//! serve until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::warn;

use auditd_api::{api_router, worker::run_expiration_worker, AppState};
use auditd_notify::{Notifier, NotifierConfig, SmtpConfig};
use auditd_persist::{ApprovalStore, DbPool, EventStore, StreamHub};
use auditd_policy::{PolicyConfig, PolicyEngine};

mod stream_socket;

/// Centralized governance daemon for multi-agent platforms
#[derive(Debug, Parser)]
#[command(
    name = "auditd",
    version,
    about = "Tamper-evident audit chain, approval workflow and policy enforcement"
)]
struct Cli {
    /// Address for the HTTP API; a bare `:port` binds all interfaces
    #[arg(long, env = "AUDITD_LISTEN", default_value = ":1199")]
    listen: String,

    /// Database path or DSN; `postgres://` selects the server engine
    #[arg(long, env = "AUDITD_DB", default_value = "sqlite:auditd.db?mode=rwc")]
    db: String,

    /// Unix socket for the newline-delimited event push stream
    #[arg(long, env = "AUDITD_SOCKET")]
    socket: Option<PathBuf>,

    /// YAML policy file; without it the engine is disabled and
    /// /v1/governance/check answers 503
    #[arg(long, env = "AUDITD_POLICY_FILE")]
    policy_file: Option<PathBuf>,

    /// Deny when no policy rule matches (overrides the file's default)
    #[arg(long, env = "AUDITD_DEFAULT_DENY")]
    default_deny: bool,

    /// Webhook URL notified on approval lifecycle events
    #[arg(long, env = "AUDITD_APPROVAL_WEBHOOK")]
    approval_webhook: Option<String>,

    /// Public base URL embedded in notification links
    #[arg(long, env = "AUDITD_APPROVAL_BASE_URL")]
    approval_base_url: Option<String>,

    #[arg(long, env = "AUDITD_SMTP_HOST")]
    smtp_host: Option<String>,

    #[arg(long, env = "AUDITD_SMTP_PORT", default_value_t = 587)]
    smtp_port: u16,

    #[arg(long, env = "AUDITD_SMTP_USER")]
    smtp_user: Option<String>,

    #[arg(long, env = "AUDITD_SMTP_PASSWORD")]
    smtp_password: Option<String>,

    #[arg(long, env = "AUDITD_EMAIL_FROM")]
    email_from: Option<String>,

    #[arg(long, env = "AUDITD_EMAIL_TO")]
    email_to: Option<String>,

    /// Seconds between expiration sweeps over pending approvals
    #[arg(long, env = "AUDITD_EXPIRE_INTERVAL_SECS", default_value_t = 60)]
    expire_interval_secs: u64,
}

/// Accept `host:port` or the bare `:port` shorthand
fn parse_listen(listen: &str) -> Result<SocketAddr> {
    let normalized = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };
    normalized
        .parse()
        .with_context(|| format!("invalid listen address {:?}", listen))
}

fn build_notifier(cli: &Cli) -> Notifier {
    let smtp = cli.smtp_host.as_ref().map(|host| SmtpConfig {
        host: host.clone(),
        port: cli.smtp_port,
        username: cli.smtp_user.clone(),
        password: cli.smtp_password.clone(),
    });
    Notifier::new(NotifierConfig {
        webhook_url: cli.approval_webhook.clone(),
        base_url: cli.approval_base_url.clone(),
        smtp,
        email_from: cli.email_from.clone(),
        email_to: cli.email_to.clone(),
    })
}

fn build_engine(cli: &Cli) -> Result<Option<Arc<PolicyEngine>>> {
    let Some(path) = &cli.policy_file else {
        warn!("no policy file configured; /v1/governance/check will answer 503");
        return Ok(None);
    };
    let mut config =
        PolicyConfig::load(path).with_context(|| format!("load policy file {}", path.display()))?;
    if cli.default_deny {
        config.default_deny = true;
    }
    let engine = PolicyEngine::new(config).context("compile policy configuration")?;
    tracing::info!(
        policies = engine.policy_count(),
        rules = engine.rule_count(),
        default_deny = engine.default_deny(),
        "policy engine ready"
    );
    Ok(Some(Arc::new(engine)))
}

#[tokio::main]
async fn main() -> Result<()> {
    auditd_api::server::init_tracing();
    let cli = Cli::parse();

    let addr = parse_listen(&cli.listen)?;
    let db = DbPool::connect(&cli.db)
        .await
        .with_context(|| format!("open database {:?}", cli.db))?;

    let hub = StreamHub::new();
    let events = Arc::new(
        EventStore::open(db.clone(), hub.clone())
            .await
            .context("open event store")?,
    );
    let approvals = Arc::new(ApprovalStore::open(db).await.context("open approval store")?);
    let engine = build_engine(&cli)?;
    let notifier = Arc::new(build_notifier(&cli));

    let state = AppState::new(
        events,
        approvals.clone(),
        engine,
        notifier,
        cli.policy_file.as_ref().map(|p| p.display().to_string()),
    );
    let app = api_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(run_expiration_worker(
        approvals,
        Duration::from_secs(cli.expire_interval_secs.max(1)),
        shutdown_rx.clone(),
    ));

    if let Some(socket) = cli.socket.clone() {
        let hub = hub.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = stream_socket::run_stream_listener(socket, hub, shutdown).await {
                warn!(error = %e, "push stream listener failed");
            }
        });
    }

    auditd_api::server::run(addr, app, shutdown_tx)
        .await
        .context("serve http api")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addresses_parse() {
        assert_eq!(
            parse_listen(":1199").unwrap(),
            "0.0.0.0:1199".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen("127.0.0.1:8900").unwrap(),
            "127.0.0.1:8900".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen("nonsense").is_err());
    }

    #[test]
    fn cli_defaults_match_the_daemon_contract() {
        let cli = Cli::try_parse_from(["auditd"]).unwrap();
        assert_eq!(cli.listen, ":1199");
        assert!(cli.db.starts_with("sqlite:"));
        assert_eq!(cli.smtp_port, 587);
        assert_eq!(cli.expire_interval_secs, 60);
        assert!(cli.socket.is_none());
        assert!(!cli.default_deny);
    }

    #[test]
    fn flags_configure_every_side_channel() {
        let cli = Cli::try_parse_from([
            "auditd",
            "--listen",
            "127.0.0.1:9000",
            "--db",
            "postgres://audit:pw@db/audit",
            "--socket",
            "/run/auditd.sock",
            "--approval-webhook",
            "https://hooks.slack.com/services/T/B/x",
            "--smtp-host",
            "mail.example.com",
            "--email-from",
            "auditd@example.com",
            "--email-to",
            "ops@example.com",
            "--default-deny",
        ])
        .unwrap();
        assert!(cli.db.starts_with("postgres://"));
        assert!(cli.default_deny);
        let notifier = build_notifier(&cli);
        assert!(notifier.webhook_configured());
        assert!(notifier.email_configured());
    }
}
