//! Inbound ingestion pipeline — shared by the relay session and the
//! mailbox poll.
//!
//! Order per message: resolve owner → dedup + normalize → rule engine →
//! auto-reply decision → persist. Rule or auto-reply failures degrade to
//! "no rules applied" / "no reply" with a warning; the message is always
//! persisted to its default folder.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::autoreply::AutoReplyEngine;
use crate::blobs::BlobStore;
use crate::error::{Error, IngestError, Result};
use crate::ingest::normalizer::{Normalizer, ParsedMessage};
use crate::model::MailUser;
use crate::rules;
use crate::store::MailStore;

/// Routes normalized inbound mail through the engines and into the store.
pub struct IngestPipeline {
    store: Arc<dyn MailStore>,
    normalizer: Normalizer,
    autoreply: AutoReplyEngine,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn MailStore>,
        blobs: Arc<dyn BlobStore>,
        autoreply: AutoReplyEngine,
    ) -> Self {
        Self {
            normalizer: Normalizer::new(Arc::clone(&store), blobs),
            store,
            autoreply,
        }
    }

    /// Resolve the local owner for a recipient address, case-insensitively.
    /// Inactive owners are treated as absent.
    pub async fn resolve_owner(&self, address: &str) -> Result<Option<MailUser>> {
        let user = self.store.find_user_by_address(address).await?;
        Ok(user.filter(|u| u.is_active))
    }

    /// Process one parsed message for one local mailbox.
    ///
    /// Returns the stored record id, or `None` when the message was a
    /// duplicate (expected under overlapping poll windows — discarded
    /// silently).
    pub async fn process_inbound(
        &self,
        parsed: &ParsedMessage,
        owner: &MailUser,
    ) -> Result<Option<Uuid>> {
        let email = match self.normalizer.from_wire(parsed, owner).await {
            Ok(email) => email,
            Err(Error::Ingest(IngestError::DuplicateMessage { message_id, .. })) => {
                debug!(owner = %owner.id, message_id = %message_id, "Discarding duplicate");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        // Rules mutate the record before it is persisted. A rules failure
        // must not lose the message.
        let email = match self.store.list_rules(&owner.id).await {
            Ok(rules) => {
                let (email, applied) = rules::apply(email, &rules);
                for action in &applied {
                    debug!(
                        email = %email.id,
                        rule = %action.rule_name,
                        action = %action.action,
                        "Rule action applied"
                    );
                }
                email
            }
            Err(e) => {
                warn!(owner = %owner.id, "Rules unavailable, storing unprocessed: {e}");
                email
            }
        };

        match self.autoreply.maybe_reply(&email).await {
            Ok(decision) if decision.sent => {
                debug!(owner = %owner.id, "Auto-reply queued for {}", email.from.email);
            }
            Ok(decision) => {
                debug!(owner = %owner.id, reason = %decision.reason, "No auto-reply");
            }
            Err(e) => {
                warn!(owner = %owner.id, "Auto-reply evaluation failed: {e}");
            }
        }

        self.store.insert_email(&email).await?;
        info!(
            email = %email.id,
            owner = %owner.id,
            folder = %email.folder,
            from = %email.from.email,
            "Inbound email stored"
        );
        Ok(Some(email.id))
    }

    /// Fan a parsed message out to every addressed local mailbox.
    ///
    /// Unknown recipients are skipped with a debug log; per-mailbox
    /// failures are logged and do not abort the rest of the fan-out.
    pub async fn deliver_to_local_mailboxes(&self, parsed: &ParsedMessage) -> Result<usize> {
        let mut stored = 0;
        let mut seen_owners: Vec<String> = Vec::new();

        for recipient in parsed.recipients() {
            let owner = match self.resolve_owner(&recipient.email).await {
                Ok(Some(owner)) => owner,
                Ok(None) => {
                    debug!(recipient = %recipient.email, "No local mailbox, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(recipient = %recipient.email, "Owner lookup failed: {e}");
                    continue;
                }
            };

            // One record per mailbox, even when an owner is addressed twice
            // (To + Cc).
            if seen_owners.iter().any(|id| id == &owner.id) {
                continue;
            }
            seen_owners.push(owner.id.clone());

            match self.process_inbound(parsed, &owner).await {
                Ok(Some(_)) => stored += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(owner = %owner.id, "Failed to store inbound email: {e}");
                }
            }
        }

        Ok(stored)
    }
}
