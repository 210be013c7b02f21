//! Canonical data model shared across the core.
//!
//! Every ingestion source (relay session, mailbox poll, user compose)
//! normalizes into the same `Email` record; the rule engine, auto-responder
//! and outbox all operate on this one shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Addresses ───────────────────────────────────────────────────────

/// A mail participant: address plus optional display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub email: String,
    #[serde(default)]
    pub name: String,
}

impl Address {
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
        }
    }

    pub fn bare(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: String::new(),
        }
    }

    /// Display name when present, address otherwise.
    pub fn display(&self) -> &str {
        if self.name.is_empty() {
            &self.email
        } else {
            &self.name
        }
    }

    /// The part after the `@`, lowercased. Empty for malformed addresses.
    pub fn domain(&self) -> String {
        domain_of(&self.email)
    }
}

/// Lowercased domain part of an address, or empty.
pub fn domain_of(address: &str) -> String {
    address
        .rsplit_once('@')
        .map(|(_, d)| d.to_lowercase())
        .unwrap_or_default()
}

/// Local part of an address (before the `@`).
pub fn local_part_of(address: &str) -> &str {
    address.rsplit_once('@').map(|(l, _)| l).unwrap_or(address)
}

// ── Folders ─────────────────────────────────────────────────────────

/// The visible location of a record within its owning mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Outbox,
}

impl Folder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
            Self::Drafts => "drafts",
            Self::Trash => "trash",
            Self::Spam => "spam",
            Self::Outbox => "outbox",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbox" => Some(Self::Inbox),
            "sent" => Some(Self::Sent),
            "drafts" => Some(Self::Drafts),
            "trash" => Some(Self::Trash),
            "spam" => Some(Self::Spam),
            "outbox" => Some(Self::Outbox),
            _ => None,
        }
    }
}

impl std::fmt::Display for Folder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Attachments ─────────────────────────────────────────────────────

/// Reference to attachment bytes held by the blob store.
///
/// Records never carry attachment content; blobs are written before the
/// referencing record so a stored record never points at a missing blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub url: String,
}

// ── Email ───────────────────────────────────────────────────────────

/// The canonical mail record.
///
/// Exactly one owning mailbox per record; `(owner_id, folder)` defines the
/// record's visible location. Only the owning mailbox's pipeline mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    pub id: Uuid,
    /// Protocol Message-ID. Generated when the wire message lacks one.
    pub message_id: String,
    pub from: Address,
    pub to: Vec<Address>,
    #[serde(default)]
    pub cc: Vec<Address>,
    #[serde(default)]
    pub bcc: Vec<Address>,
    pub subject: String,
    pub html_body: String,
    pub plain_body: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    pub folder: Folder,
    pub is_read: bool,
    pub is_starred: bool,
    #[serde(default)]
    pub labels: Vec<String>,
    pub thread_id: String,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Transport receipt, present only on delivered Sent records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpMetadata>,
}

impl Email {
    /// Add a label if not already present (set semantics).
    pub fn add_label(&mut self, label: &str) {
        if !self.labels.iter().any(|l| l == label) {
            self.labels.push(label.to_string());
        }
    }

    /// All recipient addresses (to + cc + bcc), joined for rule matching.
    pub fn joined_recipients(&self) -> String {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(|a| a.email.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Thread id for a new record: the message it replies to, else itself.
pub fn thread_id_for(in_reply_to: Option<&str>, own_id: Uuid) -> String {
    match in_reply_to {
        Some(parent) if !parent.is_empty() => parent.to_string(),
        _ => own_id.to_string(),
    }
}

/// Transport receipt recorded on a Sent record after delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpMetadata {
    pub provider_message_id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub response: String,
}

// ── Compose request ─────────────────────────────────────────────────

/// A user-composed send request, as handed over by the (excluded) route
/// layer. Attachments are already-uploaded blob references.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeRequest {
    pub to: Vec<Address>,
    #[serde(default)]
    pub cc: Vec<Address>,
    #[serde(default)]
    pub bcc: Vec<Address>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub html_body: String,
    #[serde(default)]
    pub plain_body: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

// ── Users ───────────────────────────────────────────────────────────

/// A local mailbox owner. Provisioning is external; the core only reads
/// these for owner resolution, relay auth, and auto-reply placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailUser {
    pub id: String,
    pub address: String,
    pub display_name: String,
    pub is_active: bool,
}

/// Minimal inbox record for unit tests across the crate.
#[cfg(test)]
pub(crate) fn test_email() -> Email {
    let id = Uuid::new_v4();
    Email {
        id,
        message_id: format!("<{id}@example.com>"),
        from: Address::new("from@example.com", "From"),
        to: vec![Address::bare("to@example.com")],
        cc: vec![],
        bcc: vec![],
        subject: "Test".into(),
        html_body: "<p>Hi</p>".into(),
        plain_body: "Hi".into(),
        attachments: vec![],
        folder: Folder::Inbox,
        is_read: false,
        is_starred: false,
        labels: vec![],
        thread_id: id.to_string(),
        in_reply_to: None,
        references: vec![],
        owner_id: "user-1".into(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        smtp: None,
    }
}
