//! Canonical record normalizer.
//!
//! Converts a parsed wire message or a user-composed request into the one
//! `Email` shape everything downstream consumes. Attachment bytes are
//! persisted to the blob store before the record is built, so a stored
//! record never references a missing blob.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use tracing::debug;
use uuid::Uuid;

use crate::blobs::BlobStore;
use crate::error::{Error, IngestError, ValidationError};
use crate::model::{
    Address, ComposeRequest, Email, Folder, MailUser, domain_of, thread_id_for,
};
use crate::store::MailStore;

/// Fallback subject for messages that arrive without one.
pub const NO_SUBJECT: &str = "(No Subject)";

// ── Parsed wire messages ────────────────────────────────────────────

/// One attachment extracted from a wire message, bytes still in hand.
#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Owned extraction of a parsed RFC-822 message — everything the
/// normalizer needs, decoupled from `mail_parser`'s borrowed lifetimes.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub message_id: Option<String>,
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<ParsedAttachment>,
}

impl ParsedMessage {
    /// All addressed recipients (to + cc + bcc).
    pub fn recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(&self.cc).chain(&self.bcc)
    }
}

/// Parse raw message bytes into an owned [`ParsedMessage`].
pub fn parse_wire_message(raw: &[u8]) -> Result<ParsedMessage, IngestError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| IngestError::Parse("unparseable message".into()))?;

    let mut attachments = Vec::new();
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        let filename = MimeHeaders::attachment_name(part)
            .unwrap_or("attachment")
            .to_string();
        let mime_type = MimeHeaders::content_type(part)
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        attachments.push(ParsedAttachment {
            filename,
            mime_type,
            bytes: part.contents().to_vec(),
        });
    }

    Ok(ParsedMessage {
        message_id: parsed.message_id().map(str::to_string),
        from: collect_addresses(parsed.from()).into_iter().next().unwrap_or_default(),
        to: collect_addresses(parsed.to()),
        cc: collect_addresses(parsed.cc()),
        bcc: collect_addresses(parsed.bcc()),
        subject: parsed.subject().map(str::to_string),
        html_body: parsed.body_html(0).map(|s| s.to_string()),
        text_body: parsed.body_text(0).map(|s| s.to_string()),
        date: parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0)),
        in_reply_to: header_text(&parsed, "In-Reply-To"),
        references: header_text_list(&parsed, "References"),
        attachments,
    })
}

fn collect_addresses(addr: Option<&mail_parser::Address<'_>>) -> Vec<Address> {
    fn convert(a: &mail_parser::Addr<'_>) -> Option<Address> {
        a.address.as_ref().map(|email| {
            Address::new(
                email.to_string(),
                a.name.as_ref().map(|n| n.to_string()).unwrap_or_default(),
            )
        })
    }

    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs.iter().filter_map(convert).collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(convert))
            .collect(),
    }
}

fn header_text(parsed: &mail_parser::Message<'_>, name: &str) -> Option<String> {
    match parsed.header(name) {
        Some(HeaderValue::Text(t)) => Some(t.to_string()),
        Some(HeaderValue::TextList(l)) => l.first().map(|t| t.to_string()),
        _ => None,
    }
}

fn header_text_list(parsed: &mail_parser::Message<'_>, name: &str) -> Vec<String> {
    match parsed.header(name) {
        Some(HeaderValue::Text(t)) => vec![t.to_string()],
        Some(HeaderValue::TextList(l)) => l.iter().map(|t| t.to_string()).collect(),
        _ => Vec::new(),
    }
}

// ── HTML stripping ──────────────────────────────────────────────────

/// Strip HTML tags and normalize whitespace (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Normalizer ──────────────────────────────────────────────────────

/// Builds canonical records from wire messages, checking the dedup key and
/// persisting attachment blobs first.
pub struct Normalizer {
    store: Arc<dyn MailStore>,
    blobs: Arc<dyn BlobStore>,
}

impl Normalizer {
    pub fn new(store: Arc<dyn MailStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    /// Normalize an inbound wire message for one local mailbox.
    ///
    /// Records are keyed by `(owner, Message-ID)`: an existing match means
    /// a poll re-fetched something the relay already delivered (or a poll
    /// run overlapped itself) and the duplicate is discarded.
    pub async fn from_wire(
        &self,
        parsed: &ParsedMessage,
        owner: &MailUser,
    ) -> Result<Email, Error> {
        let id = Uuid::new_v4();
        let message_id = parsed
            .message_id
            .clone()
            .unwrap_or_else(|| generated_message_id(id, &owner.address));

        if self.store.email_exists(&owner.id, &message_id).await? {
            debug!(owner = %owner.id, message_id = %message_id, "Duplicate inbound message");
            return Err(IngestError::DuplicateMessage {
                message_id,
                owner_id: owner.id.clone(),
            }
            .into());
        }

        // Blobs before the record that references them.
        let mut attachments = Vec::with_capacity(parsed.attachments.len());
        for part in &parsed.attachments {
            let blob = self
                .blobs
                .put(&part.filename, &part.mime_type, &part.bytes)
                .await?;
            attachments.push(blob);
        }

        let html_body = parsed.html_body.clone().unwrap_or_default();
        let plain_body = match &parsed.text_body {
            Some(text) => text.clone(),
            None => strip_html(&html_body),
        };
        let now = Utc::now();

        Ok(Email {
            id,
            message_id,
            from: parsed.from.clone(),
            to: parsed.to.clone(),
            cc: parsed.cc.clone(),
            bcc: parsed.bcc.clone(),
            subject: parsed
                .subject
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| NO_SUBJECT.to_string()),
            html_body,
            plain_body,
            attachments,
            folder: Folder::Inbox,
            is_read: false,
            is_starred: false,
            labels: Vec::new(),
            thread_id: thread_id_for(parsed.in_reply_to.as_deref(), id),
            in_reply_to: parsed.in_reply_to.clone(),
            references: parsed.references.clone(),
            owner_id: owner.id.clone(),
            created_at: parsed.date.unwrap_or(now),
            updated_at: now,
            smtp: None,
        })
    }
}

/// Normalize a user-composed send request. Attachments are already blob
/// references; no store access needed.
pub fn from_compose(compose: ComposeRequest, owner: &MailUser) -> Result<Email, ValidationError> {
    if compose.to.is_empty() {
        return Err(ValidationError::MissingField("to".into()));
    }
    for recipient in compose.to.iter().chain(&compose.cc).chain(&compose.bcc) {
        if !recipient.email.contains('@') {
            return Err(ValidationError::InvalidAddress(recipient.email.clone()));
        }
    }

    let id = Uuid::new_v4();
    let now = Utc::now();
    let plain_body = if compose.plain_body.is_empty() {
        strip_html(&compose.html_body)
    } else {
        compose.plain_body
    };

    Ok(Email {
        id,
        message_id: generated_message_id(id, &owner.address),
        from: Address::new(owner.address.clone(), owner.display_name.clone()),
        to: compose.to,
        cc: compose.cc,
        bcc: compose.bcc,
        subject: if compose.subject.trim().is_empty() {
            NO_SUBJECT.to_string()
        } else {
            compose.subject
        },
        html_body: compose.html_body,
        plain_body,
        attachments: compose.attachments,
        folder: Folder::Outbox,
        is_read: true,
        is_starred: false,
        labels: Vec::new(),
        thread_id: thread_id_for(compose.in_reply_to.as_deref(), id),
        in_reply_to: compose.in_reply_to,
        references: Vec::new(),
        owner_id: owner.id.clone(),
        created_at: now,
        updated_at: now,
        smtp: None,
    })
}

/// `<uuid@domain>`-shaped Message-ID for records that arrive without one.
fn generated_message_id(id: Uuid, owner_address: &str) -> String {
    let domain = domain_of(owner_address);
    if domain.is_empty() {
        format!("<{id}@localhost>")
    } else {
        format!("<{id}@{domain}>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> MailUser {
        MailUser {
            id: "user-1".into(),
            address: "alice@local.test".into(),
            display_name: "Alice".into(),
            is_active: true,
        }
    }

    // ── HTML stripping ──────────────────────────────────────────────

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
    }

    #[test]
    fn strip_html_nested_with_attributes() {
        assert_eq!(
            strip_html(r#"<div><a href="https://x.test">Link</a> and <b>bold</b></div>"#),
            "Link and bold"
        );
    }

    #[test]
    fn strip_html_normalizes_whitespace() {
        assert_eq!(strip_html("<p>  Hello \n  World  </p>"), "Hello World");
    }

    #[test]
    fn strip_html_passthrough() {
        assert_eq!(strip_html("no markup"), "no markup");
        assert_eq!(strip_html(""), "");
    }

    // ── Wire parsing ────────────────────────────────────────────────

    const RAW: &[u8] = b"Message-ID: <m1@remote.test>\r\n\
        From: Bob <bob@remote.test>\r\n\
        To: Alice <alice@local.test>, carol@local.test\r\n\
        Cc: dave@local.test\r\n\
        Subject: Greetings\r\n\
        In-Reply-To: <m0@remote.test>\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        Hello there\r\n";

    #[test]
    fn parse_wire_extracts_headers() {
        let parsed = parse_wire_message(RAW).unwrap();
        assert_eq!(parsed.message_id.as_deref(), Some("m1@remote.test"));
        assert_eq!(parsed.from.email, "bob@remote.test");
        assert_eq!(parsed.from.name, "Bob");
        assert_eq!(parsed.to.len(), 2);
        assert_eq!(parsed.cc.len(), 1);
        assert_eq!(parsed.subject.as_deref(), Some("Greetings"));
        assert_eq!(parsed.in_reply_to.as_deref(), Some("m0@remote.test"));
        assert!(parsed.text_body.as_deref().unwrap().contains("Hello there"));
    }

    #[test]
    fn parse_wire_rejects_garbage() {
        assert!(parse_wire_message(b"").is_err());
    }

    // ── Compose normalization ───────────────────────────────────────

    #[test]
    fn compose_defaults_subject_and_plain_body() {
        let compose = ComposeRequest {
            to: vec![Address::bare("bob@remote.test")],
            html_body: "<p>Hi <b>Bob</b></p>".into(),
            ..ComposeRequest::default()
        };
        let email = from_compose(compose, &owner()).unwrap();
        assert_eq!(email.subject, NO_SUBJECT);
        assert_eq!(email.plain_body, "Hi Bob");
        assert_eq!(email.folder, Folder::Outbox);
        assert!(email.is_read);
        assert_eq!(email.from.email, "alice@local.test");
        assert!(email.message_id.ends_with("@local.test>"));
    }

    #[test]
    fn compose_requires_recipient() {
        let compose = ComposeRequest::default();
        assert!(matches!(
            from_compose(compose, &owner()),
            Err(ValidationError::MissingField(_))
        ));
    }

    #[test]
    fn compose_rejects_malformed_recipient() {
        let compose = ComposeRequest {
            to: vec![Address::bare("not-an-address")],
            ..ComposeRequest::default()
        };
        assert!(matches!(
            from_compose(compose, &owner()),
            Err(ValidationError::InvalidAddress(_))
        ));
    }

    #[test]
    fn compose_threads_replies() {
        let compose = ComposeRequest {
            to: vec![Address::bare("bob@remote.test")],
            in_reply_to: Some("<m0@remote.test>".into()),
            ..ComposeRequest::default()
        };
        let email = from_compose(compose, &owner()).unwrap();
        assert_eq!(email.thread_id, "<m0@remote.test>");
        assert_eq!(email.in_reply_to.as_deref(), Some("<m0@remote.test>"));
    }
}
