//! Auto-reply decision engine.
//!
//! Consumes a normalized inbound email plus the owner's config and
//! conditionally hands a reply to the outbox. The responded-to append
//! happens only after a successful hand-off: if the hand-off fails, the
//! sender stays eligible for a retry on their next message.

use std::sync::Arc;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::ingest::normalizer::strip_html;
use crate::model::{Address, ComposeRequest, Email, MailUser};
use crate::outbox::Outbox;
use crate::store::MailStore;

/// Senders that never receive an auto-reply: automated and list traffic.
static SKIP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^no-?reply@",
        r"(?i)^donotreply@",
        r"(?i)^bounce@",
        r"(?i)^mailer-daemon@",
        r"(?i)^postmaster@",
        r"(?i)-bounces@",
        r"(?i)-noreply@",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static skip pattern"))
    .collect()
});

/// Whether a sender address matches the automated-sender skip list.
pub fn is_skippable_sender(email: &str) -> bool {
    SKIP_PATTERNS.iter().any(|p| p.is_match(email))
}

/// Outcome of an auto-reply evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDecision {
    pub sent: bool,
    pub reason: String,
    /// Outbox entry id of the queued reply, when one was sent.
    pub outbox_entry: Option<Uuid>,
}

impl ReplyDecision {
    fn declined(reason: &str) -> Self {
        Self {
            sent: false,
            reason: reason.into(),
            outbox_entry: None,
        }
    }
}

/// The auto-responder. Loads config and owner from the store, hands
/// replies to the outbox.
pub struct AutoReplyEngine {
    store: Arc<dyn MailStore>,
    outbox: Arc<Outbox>,
}

impl AutoReplyEngine {
    pub fn new(store: Arc<dyn MailStore>, outbox: Arc<Outbox>) -> Self {
        Self { store, outbox }
    }

    /// Evaluate an inbound email against the owner's auto-reply config,
    /// short-circuiting on the first failing check.
    pub async fn maybe_reply(&self, inbound: &Email) -> Result<ReplyDecision> {
        let Some(config) = self.store.get_auto_reply(&inbound.owner_id).await? else {
            return Ok(ReplyDecision::declined("no auto-reply configured"));
        };

        if !config.is_active {
            return Ok(ReplyDecision::declined("not active"));
        }

        let now = Utc::now();
        if now < config.start_date {
            return Ok(ReplyDecision::declined("not started yet"));
        }

        if let Some(end) = config.end_date
            && now > end
        {
            // Validity window passed: the config expires itself.
            self.store
                .set_auto_reply_active(&inbound.owner_id, false)
                .await?;
            info!(owner = %inbound.owner_id, "Auto-reply window passed, deactivated");
            return Ok(ReplyDecision::declined("expired"));
        }

        let sender = inbound.from.email.clone();
        if sender.is_empty() {
            return Ok(ReplyDecision::declined("no sender address"));
        }
        if is_skippable_sender(&sender) {
            debug!(sender = %sender, "Skipping auto-reply (automated sender)");
            return Ok(ReplyDecision::declined("automated sender"));
        }

        if config.send_only_once && config.has_responded_to(&sender) {
            return Ok(ReplyDecision::declined("already responded"));
        }

        // The reference behavior silently drops the attempt when the owner
        // record is missing; we decline with a warning and do not retry —
        // the sender stays eligible, so the next inbound message retries
        // naturally.
        let Some(owner) = self.store.get_user(&inbound.owner_id).await? else {
            warn!(owner = %inbound.owner_id, "Owner record missing, auto-reply skipped");
            return Ok(ReplyDecision::declined("owner record unavailable"));
        };

        let body = render_template(&config.message_template, &owner, inbound, now);
        let compose = ComposeRequest {
            to: vec![Address::new(sender.clone(), inbound.from.name.clone())],
            subject: config.subject.clone(),
            plain_body: strip_html(&body),
            html_body: body,
            in_reply_to: Some(inbound.message_id.clone()),
            ..ComposeRequest::default()
        };

        let entry_id = self.outbox.submit(compose, &owner).await?;

        if config.send_only_once {
            self.store
                .append_responded_to(&inbound.owner_id, &sender)
                .await?;
        }

        info!(owner = %owner.id, to = %sender, "Auto-reply queued");
        Ok(ReplyDecision {
            sent: true,
            reason: "queued".into(),
            outbox_entry: Some(entry_id),
        })
    }
}

/// Substitute template placeholders with owner/sender/time values.
pub fn render_template(
    template: &str,
    owner: &MailUser,
    inbound: &Email,
    now: DateTime<Utc>,
) -> String {
    template
        .replace("{name}", &owner.display_name)
        .replace("{email}", &owner.address)
        .replace("{sender}", inbound.from.display())
        .replace("{date}", &now.format("%Y-%m-%d").to_string())
        .replace("{time}", &now.format("%H:%M").to_string())
}
