//! Collaborator-facing operations.
//!
//! The contracts the (excluded) CRUD/UI layer consumes: delivery
//! submission and recall, rule CRUD, auto-reply CRUD. Ownership mismatches
//! surface as `Unauthorized`, missing records as `NotFound`; neither is
//! retried.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::autoreply::AutoReplyConfig;
use crate::error::{Result, StoreError, ValidationError};
use crate::model::ComposeRequest;
use crate::outbox::{Outbox, OutboxEntry, RecallOutcome};
use crate::rules::Rule;
use crate::store::MailStore;

/// Facade over the store and outbox for the route layer.
pub struct Mailroom {
    store: Arc<dyn MailStore>,
    outbox: Arc<Outbox>,
}

impl Mailroom {
    pub fn new(store: Arc<dyn MailStore>, outbox: Arc<Outbox>) -> Self {
        Self { store, outbox }
    }

    // ── Delivery ────────────────────────────────────────────────────

    /// Enqueue a composed email for deferred delivery. Returns the outbox
    /// entry id the caller can later `recall`.
    pub async fn submit_for_delivery(
        &self,
        compose: ComposeRequest,
        owner_id: &str,
    ) -> Result<Uuid> {
        let owner = self
            .store
            .get_user(owner_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "user".into(),
                id: owner_id.to_string(),
            })?;
        if !owner.is_active {
            return Err(StoreError::Unauthorized {
                entity: "user".into(),
                id: owner_id.to_string(),
            }
            .into());
        }
        self.outbox.submit(compose, &owner).await
    }

    /// Attempt to cancel a queued delivery. `success = false` means the
    /// message has already begun or completed sending.
    pub async fn recall(&self, entry_id: Uuid, owner_id: &str) -> Result<RecallOutcome> {
        self.outbox.recall(entry_id, owner_id).await
    }

    /// Terminal-failed deliveries, so permanent failures stay visible.
    pub async fn list_failed_deliveries(&self, owner_id: &str) -> Result<Vec<OutboxEntry>> {
        self.outbox.list_failed(owner_id).await
    }

    // ── Rules ───────────────────────────────────────────────────────

    pub async fn list_rules(&self, owner_id: &str) -> Result<Vec<Rule>> {
        Ok(self.store.list_rules(owner_id).await?)
    }

    /// Validate and save a rule. Malformed rules are rejected here, at
    /// save time, not at evaluation time.
    pub async fn upsert_rule(&self, mut rule: Rule) -> Result<Rule> {
        rule.validate()?;
        rule.updated_at = Utc::now();
        self.store.upsert_rule(&rule).await?;
        info!(rule = %rule.id, owner = %rule.owner_id, name = %rule.name, "Rule saved");
        Ok(rule)
    }

    pub async fn delete_rule(&self, id: Uuid, owner_id: &str) -> Result<()> {
        self.store.delete_rule(id, owner_id).await?;
        info!(rule = %id, owner = %owner_id, "Rule deleted");
        Ok(())
    }

    /// Flip a rule's active flag; returns the new state.
    pub async fn toggle_rule(&self, id: Uuid, owner_id: &str) -> Result<bool> {
        let rule = self.store.get_rule(id, owner_id).await?;
        let active = !rule.is_active;
        self.store.set_rule_active(id, owner_id, active).await?;
        Ok(active)
    }

    // ── Auto-reply ──────────────────────────────────────────────────

    pub async fn get_auto_reply(&self, owner_id: &str) -> Result<Option<AutoReplyConfig>> {
        Ok(self.store.get_auto_reply(owner_id).await?)
    }

    pub async fn upsert_auto_reply(&self, mut config: AutoReplyConfig) -> Result<()> {
        if config.owner_id.is_empty() {
            return Err(ValidationError::MissingField("owner_id".into()).into());
        }
        if let Some(end) = config.end_date
            && end < config.start_date
        {
            return Err(ValidationError::InvalidField {
                field: "end_date".into(),
                message: "ends before it starts".into(),
            }
            .into());
        }
        config.updated_at = Utc::now();
        self.store.upsert_auto_reply(&config).await?;
        info!(owner = %config.owner_id, active = config.is_active, "Auto-reply saved");
        Ok(())
    }

    /// Flip the auto-reply active flag; returns the new state.
    pub async fn toggle_auto_reply(&self, owner_id: &str) -> Result<bool> {
        let config = self
            .store
            .get_auto_reply(owner_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "auto-reply config".into(),
                id: owner_id.to_string(),
            })?;
        let active = !config.is_active;
        self.store.set_auto_reply_active(owner_id, active).await?;
        Ok(active)
    }

    /// Reset the responded-to list (testing / season reset).
    pub async fn clear_responded(&self, owner_id: &str) -> Result<()> {
        Ok(self.store.clear_responded_to(owner_id).await?)
    }

    pub async fn delete_auto_reply(&self, owner_id: &str) -> Result<()> {
        Ok(self.store.delete_auto_reply(owner_id).await?)
    }
}
