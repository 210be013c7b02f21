//! Deferred delivery: outbox entries, submission, and recall.
//!
//! An outbox entry holds an outbound record for a grace period during which
//! the sender may recall it. The sweep in [`scheduler`] delivers entries
//! whose grace has expired.

pub mod scheduler;

pub use scheduler::OutboxScheduler;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::ingest::normalizer;
use crate::model::{ComposeRequest, Folder, MailUser};
use crate::store::MailStore;

/// Delivery state of an outbox entry.
///
/// `Pending → Sending` happens only through the scheduler's atomic claim;
/// a concurrent recall and claim cannot both succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Sent,
    Recalled,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Recalled => "recalled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "recalled" => Some(Self::Recalled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Scheduling state for one outbound record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub email_id: Uuid,
    pub owner_id: String,
    pub scheduled_send_time: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    /// Earliest time the next delivery attempt may run (backoff).
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(email_id: Uuid, owner_id: &str, scheduled_send_time: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email_id,
            owner_id: owner_id.to_string(),
            scheduled_send_time,
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_attempt_at: scheduled_send_time,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of a recall attempt. `success = false` means the sweep won the
/// race: the message has already begun or completed sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallOutcome {
    pub success: bool,
    /// State observed at decision time.
    pub status: DeliveryStatus,
}

/// Submission/recall API over the store. Delivery itself lives in the
/// scheduler; this type never touches the transport.
pub struct Outbox {
    store: Arc<dyn MailStore>,
    grace_period: Duration,
}

impl Outbox {
    pub fn new(store: Arc<dyn MailStore>, grace_period: Duration) -> Self {
        Self {
            store,
            grace_period,
        }
    }

    /// Enqueue a user-composed send. The record lands in the outbox folder
    /// with `scheduled_send_time = now + grace_period`; delivery happens on
    /// a later sweep unless the owner recalls first.
    pub async fn submit(&self, compose: ComposeRequest, owner: &MailUser) -> Result<Uuid> {
        let email = normalizer::from_compose(compose, owner)?;
        let scheduled =
            Utc::now() + chrono::Duration::seconds(self.grace_period.as_secs() as i64);
        let entry = OutboxEntry::new(email.id, &owner.id, scheduled);

        self.store.insert_email(&email).await?;
        self.store.insert_outbox_entry(&entry).await?;

        info!(
            entry = %entry.id,
            email = %email.id,
            owner = %owner.id,
            scheduled = %scheduled,
            "Queued outbound email"
        );
        Ok(entry.id)
    }

    /// Attempt to cancel delivery. Best-effort: succeeds only if it wins
    /// the race against the sweep's claim; callers must check the outcome.
    /// On success the record moves to Drafts and the entry is removed.
    pub async fn recall(&self, entry_id: Uuid, owner_id: &str) -> Result<RecallOutcome> {
        let entry = self
            .store
            .get_outbox_entry(entry_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "outbox entry".into(),
                id: entry_id.to_string(),
            })?;

        if entry.owner_id != owner_id {
            return Err(StoreError::Unauthorized {
                entity: "outbox entry".into(),
                id: entry_id.to_string(),
            }
            .into());
        }

        if self.store.recall_outbox_entry(entry_id, Utc::now()).await? {
            self.store
                .move_email(entry.email_id, owner_id, Folder::Drafts)
                .await?;
            self.store.delete_outbox_entry(entry_id).await?;
            info!(entry = %entry_id, owner = %owner_id, "Recalled outbound email");
            return Ok(RecallOutcome {
                success: true,
                status: DeliveryStatus::Recalled,
            });
        }

        // Lost the race — report what the entry looks like now.
        let observed = self
            .store
            .get_outbox_entry(entry_id)
            .await?
            .map(|e| e.status)
            .unwrap_or(DeliveryStatus::Sent);
        debug!(entry = %entry_id, status = observed.as_str(), "Recall lost the race");
        Ok(RecallOutcome {
            success: false,
            status: observed,
        })
    }

    /// Terminal-failed entries, so permanent failures stay user-visible.
    pub async fn list_failed(&self, owner_id: &str) -> Result<Vec<OutboxEntry>> {
        Ok(self.store.list_failed_outbox(owner_id).await?)
    }
}
