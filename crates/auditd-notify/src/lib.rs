//! # auditd-notify
//!
//! Outbound side channels for the approval workflow. Three sinks, each
//! configured independently: a webhook URL (generic JSON, Slack-shaped when
//! the URL points at slack.com), SMTP email, and the per-request callback URL
//! stored on the approval record.
//!
//! Strictly best-effort: the approval state machine never depends on a sink,
//! failures are logged and dropped, and callers fire these from a spawned
//! task so the request path is never blocked. Each outbound HTTP call is
//! bounded by a 10 second client timeout.

use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

use auditd_core::{ApprovalRequest, ApprovalStatus};

const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("smtp send failed: {0}")]
    Smtp(String),

    #[error("bad mail address: {0}")]
    Address(String),
}

/// SMTP relay settings
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Notifier configuration; every sink is optional
#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
    /// Public base URL of the daemon, used to embed operator links
    pub base_url: Option<String>,
    pub smtp: Option<SmtpConfig>,
    pub email_from: Option<String>,
    pub email_to: Option<String>,
}

/// Outbound notifier for approval lifecycle events
pub struct Notifier {
    config: NotifierConfig,
    http: reqwest::Client,
    mailer: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl Notifier {
    pub fn new(config: NotifierConfig) -> Self {
        let mailer = config.smtp.as_ref().and_then(|smtp| {
            let builder = match AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host) {
                Ok(b) => b.port(smtp.port),
                Err(e) => {
                    warn!(host = %smtp.host, error = %e, "smtp relay setup failed; email disabled");
                    return None;
                }
            };
            let builder = match (&smtp.username, &smtp.password) {
                (Some(user), Some(pass)) => {
                    builder.credentials(Credentials::new(user.clone(), pass.clone()))
                }
                _ => builder,
            };
            Some(builder.timeout(Some(OUTBOUND_TIMEOUT)).build())
        });

        let http = reqwest::Client::builder()
            .timeout(OUTBOUND_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self { config, http, mailer }
    }

    pub fn webhook_configured(&self) -> bool {
        self.config.webhook_url.is_some()
    }

    pub fn email_configured(&self) -> bool {
        self.mailer.is_some() && self.config.email_from.is_some() && self.config.email_to.is_some()
    }

    /// Announce a freshly-created pending request: webhook + email
    pub async fn notify_created(&self, approval: &ApprovalRequest) {
        if let Some(url) = self.config.webhook_url.clone() {
            let payload = self.payload_for(&url, "approval.created", approval);
            if let Err(e) = self.post_json(&url, &payload).await {
                warn!(approval_id = %approval.approval_id, error = %e, "created webhook failed");
            }
        }
        if self.email_configured() {
            let subject = format!(
                "[auditd] approval needed: {} by {}",
                display_action(approval),
                display_requester(approval)
            );
            if let Err(e) = self.send_email(&subject, &created_email_body(approval, self.config.base_url.as_deref())).await {
                warn!(approval_id = %approval.approval_id, error = %e, "created email failed");
            }
        }
    }

    /// Announce a resolution: callback to the stored URL, webhook, and email
    /// for denials. Returns whether the callback went out, so the caller can
    /// record `callback_sent_at`.
    pub async fn notify_resolved(&self, approval: &ApprovalRequest) -> bool {
        let mut callback_sent = false;
        if let Some(url) = approval.callback_url.as_deref() {
            let payload = webhook_payload("approval.resolved", approval, self.config.base_url.as_deref());
            match self.post_json(url, &payload).await {
                Ok(()) => {
                    info!(approval_id = %approval.approval_id, "resolution callback delivered");
                    callback_sent = true;
                }
                Err(e) => {
                    warn!(approval_id = %approval.approval_id, error = %e, "resolution callback failed");
                }
            }
        }

        if let Some(url) = self.config.webhook_url.clone() {
            let payload = self.payload_for(&url, "approval.resolved", approval);
            if let Err(e) = self.post_json(&url, &payload).await {
                warn!(approval_id = %approval.approval_id, error = %e, "resolved webhook failed");
            }
        }

        // Operators only want mail when a request was turned down.
        if approval.status == ApprovalStatus::Denied && self.email_configured() {
            let subject = format!("[auditd] approval denied: {}", display_action(approval));
            if let Err(e) = self.send_email(&subject, &resolved_email_body(approval)).await {
                warn!(approval_id = %approval.approval_id, error = %e, "denial email failed");
            }
        }

        callback_sent
    }

    /// Slack endpoints get the Slack message shape, everything else the
    /// generic envelope; callbacks always get the envelope.
    fn payload_for(
        &self,
        url: &str,
        kind: &str,
        approval: &ApprovalRequest,
    ) -> serde_json::Value {
        if is_slack_url(url) {
            slack_payload(kind, approval, self.config.base_url.as_deref())
        } else {
            webhook_payload(kind, approval, self.config.base_url.as_deref())
        }
    }

    async fn post_json(&self, url: &str, payload: &serde_json::Value) -> Result<(), NotifyError> {
        self.http
            .post(url)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn send_email(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let (mailer, from, to) = match (&self.mailer, &self.config.email_from, &self.config.email_to)
        {
            (Some(mailer), Some(from), Some(to)) => (mailer, from, to),
            _ => return Ok(()),
        };

        let message = Message::builder()
            .from(from.parse().map_err(|_| NotifyError::Address(from.clone()))?)
            .to(to.parse().map_err(|_| NotifyError::Address(to.clone()))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;

        mailer
            .send(message)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;
        Ok(())
    }
}

fn display_action(approval: &ApprovalRequest) -> String {
    if approval.tool_name.is_empty() {
        format!("{} on {}", approval.action_class, approval.resource_name)
    } else {
        format!(
            "{} ({} on {})",
            approval.tool_name, approval.action_class, approval.resource_name
        )
    }
}

fn display_requester(approval: &ApprovalRequest) -> &str {
    if approval.agent_name.is_empty() {
        if approval.requested_by.is_empty() {
            "unknown"
        } else {
            &approval.requested_by
        }
    } else {
        &approval.agent_name
    }
}

fn approval_link(approval: &ApprovalRequest, base_url: Option<&str>) -> Option<String> {
    base_url.map(|base| {
        format!(
            "{}/v1/approvals/{}",
            base.trim_end_matches('/'),
            approval.approval_id
        )
    })
}

/// Generic webhook envelope carrying the full approval record
fn webhook_payload(
    kind: &str,
    approval: &ApprovalRequest,
    base_url: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "kind": kind,
        "approval": serde_json::to_value(approval).unwrap_or_default(),
        "link": approval_link(approval, base_url),
    })
}

/// True when a webhook URL should receive Slack-formatted payloads
pub fn is_slack_url(url: &str) -> bool {
    url.contains("slack.com")
}

/// Slack-renderable message for a lifecycle event
pub fn slack_payload(
    kind: &str,
    approval: &ApprovalRequest,
    base_url: Option<&str>,
) -> serde_json::Value {
    let headline = match kind {
        "approval.created" => format!(
            ":hourglass: Approval needed: *{}* requested by *{}*",
            display_action(approval),
            display_requester(approval)
        ),
        _ => format!(
            ":white_check_mark: Approval {}: *{}* ({})",
            approval.status,
            display_action(approval),
            approval
                .resolved_by
                .as_deref()
                .unwrap_or("system")
        ),
    };
    let mut text = headline;
    if let Some(link) = approval_link(approval, base_url) {
        text.push_str(&format!("\n<{}|Review request>", link));
    }
    serde_json::json!({
        "text": text,
        "attachments": [{
            "fields": [
                {"title": "Approval", "value": approval.approval_id, "short": true},
                {"title": "Trace", "value": approval.trace_id, "short": true},
                {"title": "Resource", "value": format!("{} {}", approval.resource_type, approval.resource_name), "short": true},
                {"title": "Policy", "value": approval.policy_name, "short": true},
            ]
        }]
    })
}

fn created_email_body(approval: &ApprovalRequest, base_url: Option<&str>) -> String {
    let mut body = format!(
        "An agent action is waiting for approval.\n\n\
         Approval:  {}\n\
         Requested: {} by {}\n\
         Action:    {}\n\
         Resource:  {} {}\n\
         Policy:    {}\n\
         Expires:   {}\n",
        approval.approval_id,
        approval.requested_at.to_rfc3339(),
        display_requester(approval),
        display_action(approval),
        approval.resource_type,
        approval.resource_name,
        approval.policy_name,
        approval.expires_at.to_rfc3339(),
    );
    if let Some(link) = approval_link(approval, base_url) {
        body.push_str(&format!("\nReview: {}\n", link));
    }
    body
}

fn resolved_email_body(approval: &ApprovalRequest) -> String {
    format!(
        "An approval request was resolved.\n\n\
         Approval: {}\n\
         Status:   {}\n\
         By:       {}\n\
         Reason:   {}\n\
         Action:   {}\n",
        approval.approval_id,
        approval.status,
        approval.resolved_by.as_deref().unwrap_or("system"),
        approval.resolution_reason.as_deref().unwrap_or("-"),
        display_action(approval),
    )
}
