//! Outbox sweep — delivers due entries exactly once.
//!
//! A fixed-interval sweep claims due pending entries via the store's
//! compare-and-set and hands winners to the transport. The sweep is
//! single-flight: an in-progress guard owned by the scheduler skips a tick
//! while a sweep is active. The guard is process-local — multiple service
//! instances each run independent sweeps, and the store-level claim is
//! what keeps a concurrent recall (or another instance's sweep) from
//! double-delivering an entry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blobs::BlobStore;
use crate::config::MailroomConfig;
use crate::error::{Error, TransportError};
use crate::model::{Email, Folder, SmtpMetadata};
use crate::outbox::OutboxEntry;
use crate::store::MailStore;
use crate::transport::{OutboundAttachment, OutboundMessage, Transport, TransportSelector};

/// Counters for one sweep run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries claimed by this sweep.
    pub claimed: usize,
    pub sent: usize,
    /// Failed attempts (retrying or terminal).
    pub failed: usize,
    /// True when the tick was skipped because a sweep was still running.
    pub skipped: bool,
}

/// Drives the outbox state machine.
pub struct OutboxScheduler {
    store: Arc<dyn MailStore>,
    blobs: Arc<dyn BlobStore>,
    transport: Arc<dyn Transport>,
    selector: TransportSelector,
    config: MailroomConfig,
    sweep_active: AtomicBool,
}

impl OutboxScheduler {
    pub fn new(
        store: Arc<dyn MailStore>,
        blobs: Arc<dyn BlobStore>,
        transport: Arc<dyn Transport>,
        selector: TransportSelector,
        config: MailroomConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            transport,
            selector,
            config,
            sweep_active: AtomicBool::new(false),
        }
    }

    /// Spawn the periodic sweep task. Returns the handle and a shutdown
    /// flag; set the flag to stop after the current tick.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(
                "Outbox sweep started — every {:?}, grace {:?}",
                self.config.sweep_interval, self.config.grace_period
            );

            let mut tick = tokio::time::interval(self.config.sweep_interval);

            loop {
                tick.tick().await;

                if shutdown.load(Ordering::Relaxed) {
                    info!("Outbox sweep shutting down");
                    return;
                }

                let stats = self.sweep_once().await;
                if stats.claimed > 0 {
                    info!(
                        claimed = stats.claimed,
                        sent = stats.sent,
                        failed = stats.failed,
                        "Outbox sweep complete"
                    );
                }
            }
        });

        (handle, shutdown_flag)
    }

    /// Run a single sweep. Public so tests (and operators) can drive the
    /// state machine without the timer.
    pub async fn sweep_once(&self) -> SweepStats {
        // Single-flight guard: only one sweep per process at a time.
        if self
            .sweep_active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("Skipping sweep (previous run still in progress)");
            return SweepStats {
                skipped: true,
                ..SweepStats::default()
            };
        }

        let stats = self.run_sweep().await;
        self.sweep_active.store(false, Ordering::Release);
        stats
    }

    async fn run_sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let now = Utc::now();

        let due = match self.store.due_outbox_entries(now).await {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to query due outbox entries: {e}");
                return stats;
            }
        };

        for entry in due {
            // The claim is the race point: a concurrent recall (or another
            // instance) may have moved the entry since the query.
            match self.store.claim_outbox_entry(entry.id, now).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(entry = %entry.id, "Entry no longer pending, skipping");
                    continue;
                }
                Err(e) => {
                    error!(entry = %entry.id, "Claim failed: {e}");
                    continue;
                }
            }
            stats.claimed += 1;

            match self.deliver_entry(&entry).await {
                Ok(()) => stats.sent += 1,
                Err(e) => {
                    stats.failed += 1;
                    self.record_failure(&entry, &e).await;
                }
            }
        }

        stats
    }

    /// Deliver one claimed entry and persist the Sent record.
    async fn deliver_entry(&self, entry: &OutboxEntry) -> Result<(), Error> {
        let mut email = self
            .store
            .get_email(entry.email_id, &entry.owner_id)
            .await?;

        let route = self.selector.select(&email.from)?;
        let mut outbound = self.build_outbound(&email).await?;
        if let Some(rewrite) = &route.rewrite {
            debug!(
                entry = %entry.id,
                relay_from = %rewrite.from.email,
                "Relay fallback — rewriting From/Reply-To"
            );
            outbound.apply_rewrite(rewrite);
        }

        let receipt = tokio::time::timeout(
            self.config.transport_timeout,
            self.transport.deliver(&route.profile, &outbound),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            timeout: self.config.transport_timeout,
        })??;

        // Delivery succeeded: the record moves to Sent with the transport
        // receipt, and the entry's lifecycle ends.
        email.folder = Folder::Sent;
        email.is_read = true;
        email.smtp = Some(SmtpMetadata {
            provider_message_id: receipt.provider_message_id,
            accepted: receipt.accepted,
            rejected: receipt.rejected,
            response: receipt.response,
        });
        email.updated_at = Utc::now();
        self.store.update_email(&email).await?;
        self.store.delete_outbox_entry(entry.id).await?;

        info!(entry = %entry.id, email = %email.id, "Outbound email delivered");
        Ok(())
    }

    /// Resolve attachment bytes and build the wire message.
    async fn build_outbound(&self, email: &Email) -> Result<OutboundMessage, Error> {
        let mut attachments = Vec::with_capacity(email.attachments.len());
        for attachment in &email.attachments {
            let bytes = self.blobs.get(&attachment.id).await?;
            attachments.push(OutboundAttachment {
                filename: attachment.filename.clone(),
                mime_type: attachment.mime_type.clone(),
                bytes,
            });
        }

        Ok(OutboundMessage {
            from: email.from.clone(),
            reply_to: None,
            to: email.to.clone(),
            cc: email.cc.clone(),
            bcc: email.bcc.clone(),
            subject: email.subject.clone(),
            html_body: email.html_body.clone(),
            plain_body: email.plain_body.clone(),
            message_id: email.message_id.clone(),
            in_reply_to: email.in_reply_to.clone(),
            attachments,
        })
    }

    /// Revert to pending with backoff, or go terminal after the bound.
    async fn record_failure(&self, entry: &OutboxEntry, error: &Error) {
        let attempts = entry.attempts + 1;

        if attempts >= self.config.max_delivery_attempts {
            warn!(
                entry = %entry.id,
                attempts,
                "Delivery failed permanently: {error}"
            );
            if let Err(e) = self
                .store
                .fail_outbox_entry(entry.id, attempts, &error.to_string())
                .await
            {
                error!(entry = %entry.id, "Failed to mark entry failed: {e}");
            }
            return;
        }

        let backoff =
            chrono::Duration::seconds(self.config.retry_backoff.as_secs() as i64 * attempts as i64);
        let next_attempt = Utc::now() + backoff;
        warn!(
            entry = %entry.id,
            attempts,
            next_attempt = %next_attempt,
            "Delivery failed, will retry: {error}"
        );
        if let Err(e) = self
            .store
            .retry_outbox_entry(entry.id, attempts, next_attempt, &error.to_string())
            .await
        {
            error!(entry = %entry.id, "Failed to schedule retry: {e}");
        }
    }
}
