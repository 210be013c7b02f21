//! `MailStore` trait — the single async interface to the document store.
//!
//! The store is the source of truth and the only synchronization point
//! between the background tasks. The outbox claim/recall operations are
//! conditional updates (compare-and-set): the caller that observes a
//! changed row wins; everyone else sees zero rows affected and aborts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::autoreply::AutoReplyConfig;
use crate::error::StoreError;
use crate::model::{Email, Folder, MailUser};
use crate::outbox::OutboxEntry;
use crate::rules::Rule;

/// Backend-agnostic document-store trait covering mail records, outbox
/// entries, rules, auto-reply configs, and the user directory.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Emails ──────────────────────────────────────────────────────

    /// Insert a new canonical record.
    async fn insert_email(&self, email: &Email) -> Result<(), StoreError>;

    /// Fetch a record, enforcing ownership. `NotFound` if absent,
    /// `Unauthorized` on owner mismatch.
    async fn get_email(&self, id: Uuid, owner_id: &str) -> Result<Email, StoreError>;

    /// Overwrite a record (same id).
    async fn update_email(&self, email: &Email) -> Result<(), StoreError>;

    /// List a folder's records, most recent first.
    async fn list_emails(
        &self,
        owner_id: &str,
        folder: Folder,
        limit: usize,
    ) -> Result<Vec<Email>, StoreError>;

    /// Move a record to another folder.
    async fn move_email(
        &self,
        id: Uuid,
        owner_id: &str,
        folder: Folder,
    ) -> Result<(), StoreError>;

    /// Permanently delete a record.
    async fn delete_email(&self, id: Uuid, owner_id: &str) -> Result<(), StoreError>;

    /// Whether a record with this protocol Message-ID already exists for
    /// the owner. Ingestion dedup key.
    async fn email_exists(&self, owner_id: &str, message_id: &str) -> Result<bool, StoreError>;

    // ── Outbox ──────────────────────────────────────────────────────

    /// Insert a new outbox entry (status pending).
    async fn insert_outbox_entry(&self, entry: &OutboxEntry) -> Result<(), StoreError>;

    /// Fetch an entry by id.
    async fn get_outbox_entry(&self, id: Uuid) -> Result<Option<OutboxEntry>, StoreError>;

    /// All pending entries due at `now` (scheduled time reached and not
    /// backing off).
    async fn due_outbox_entries(&self, now: DateTime<Utc>)
    -> Result<Vec<OutboxEntry>, StoreError>;

    /// Atomic `pending → sending` claim, guarded by the scheduled time.
    /// Returns `true` only for the single caller that won the transition.
    async fn claim_outbox_entry(&self, id: Uuid, now: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Atomic `pending → recalled`, allowed only strictly before the
    /// scheduled send time. Returns `false` if the sweep already claimed
    /// the entry (or it left pending some other way).
    async fn recall_outbox_entry(&self, id: Uuid, now: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Remove an entry whose lifecycle has ended (sent or recalled).
    async fn delete_outbox_entry(&self, id: Uuid) -> Result<(), StoreError>;

    /// Revert `sending → pending` after a failed attempt, recording the
    /// attempt count, backoff deadline, and error.
    async fn retry_outbox_entry(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Mark an entry terminal-failed (kept, user-visible).
    async fn fail_outbox_entry(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Terminal-failed entries for an owner.
    async fn list_failed_outbox(&self, owner_id: &str) -> Result<Vec<OutboxEntry>, StoreError>;

    // ── Rules ───────────────────────────────────────────────────────

    /// Insert or replace a rule.
    async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError>;

    /// Fetch a rule, enforcing ownership.
    async fn get_rule(&self, id: Uuid, owner_id: &str) -> Result<Rule, StoreError>;

    /// An owner's rules ordered by `(priority, id)` ascending.
    async fn list_rules(&self, owner_id: &str) -> Result<Vec<Rule>, StoreError>;

    /// Delete a rule, enforcing ownership.
    async fn delete_rule(&self, id: Uuid, owner_id: &str) -> Result<(), StoreError>;

    /// Set a rule's active flag, enforcing ownership.
    async fn set_rule_active(
        &self,
        id: Uuid,
        owner_id: &str,
        active: bool,
    ) -> Result<(), StoreError>;

    // ── Auto-reply ──────────────────────────────────────────────────

    async fn get_auto_reply(&self, owner_id: &str)
    -> Result<Option<AutoReplyConfig>, StoreError>;

    /// Insert or update an owner's config. The `responded_to` list of an
    /// existing config is preserved across owner edits.
    async fn upsert_auto_reply(&self, config: &AutoReplyConfig) -> Result<(), StoreError>;

    async fn set_auto_reply_active(&self, owner_id: &str, active: bool)
    -> Result<(), StoreError>;

    /// Add a sender to `responded_to` (set union, case-insensitive).
    async fn append_responded_to(&self, owner_id: &str, sender: &str)
    -> Result<(), StoreError>;

    async fn clear_responded_to(&self, owner_id: &str) -> Result<(), StoreError>;

    async fn delete_auto_reply(&self, owner_id: &str) -> Result<(), StoreError>;

    // ── Users ───────────────────────────────────────────────────────

    /// Resolve a local mailbox owner by address, case-insensitively.
    async fn find_user_by_address(&self, address: &str)
    -> Result<Option<MailUser>, StoreError>;

    async fn get_user(&self, id: &str) -> Result<Option<MailUser>, StoreError>;

    /// Provisioning is external; this exists for operators and tests.
    async fn upsert_user(&self, user: &MailUser) -> Result<(), StoreError>;
}
