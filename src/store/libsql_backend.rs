//! libSQL backend — async `MailStore` implementation.
//!
//! Timestamps are stored as fixed-width RFC 3339 (microseconds, UTC `Z`),
//! so lexicographic comparison in SQL matches chronological order — the
//! outbox claim/recall conditions rely on that.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::autoreply::AutoReplyConfig;
use crate::error::StoreError;
use crate::model::{Address, AttachmentRef, Email, Folder, MailUser, SmtpMetadata};
use crate::outbox::{DeliveryStatus, OutboxEntry};
use crate::rules::{Rule, RuleAction, RuleConditions};
use crate::store::migrations;
use crate::store::traits::MailStore;

/// libSQL document-store backend.
///
/// Holds a single connection reused for all operations;
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Document store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to create in-memory db: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Fixed-width RFC 3339 with microseconds, always `Z`.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string.
fn parse_ts(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Convert `Option<String>` to a libsql value (`NULL` when absent).
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn query_err(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn not_found(entity: &str, id: impl ToString) -> StoreError {
    StoreError::NotFound {
        entity: entity.into(),
        id: id.to_string(),
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const EMAIL_COLUMNS: &str = "id, owner_id, message_id, folder, is_read, is_starred, subject, \
     html_body, plain_body, from_json, to_json, cc_json, bcc_json, attachments_json, \
     labels_json, thread_id, in_reply_to, references_json, smtp_json, created_at, updated_at";

fn row_to_email(row: &libsql::Row) -> Result<Email, StoreError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let folder_str: String = row.get(3).map_err(query_err)?;
    let sender_json: String = row.get(9).map_err(query_err)?;
    let to_json_str: String = row.get(10).map_err(query_err)?;
    let cc_json: String = row.get(11).map_err(query_err)?;
    let bcc_json: String = row.get(12).map_err(query_err)?;
    let attachments_json: String = row.get(13).map_err(query_err)?;
    let labels_json: String = row.get(14).map_err(query_err)?;
    let references_json: String = row.get(17).map_err(query_err)?;
    let smtp_json: Option<String> = row.get(18).ok();
    let created_str: String = row.get(19).map_err(query_err)?;
    let updated_str: String = row.get(20).map_err(query_err)?;

    Ok(Email {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| StoreError::Serialization(format!("bad email id {id_str}: {e}")))?,
        owner_id: row.get(1).map_err(query_err)?,
        message_id: row.get(2).map_err(query_err)?,
        folder: Folder::parse(&folder_str).unwrap_or(Folder::Inbox),
        is_read: row.get::<i64>(4).map_err(query_err)? != 0,
        is_starred: row.get::<i64>(5).map_err(query_err)? != 0,
        subject: row.get(6).map_err(query_err)?,
        html_body: row.get(7).map_err(query_err)?,
        plain_body: row.get(8).map_err(query_err)?,
        from: from_json::<Address>(&sender_json)?,
        to: from_json::<Vec<Address>>(&to_json_str)?,
        cc: from_json::<Vec<Address>>(&cc_json)?,
        bcc: from_json::<Vec<Address>>(&bcc_json)?,
        attachments: from_json::<Vec<AttachmentRef>>(&attachments_json)?,
        labels: from_json::<Vec<String>>(&labels_json)?,
        thread_id: row.get(15).map_err(query_err)?,
        in_reply_to: row.get::<String>(16).ok().filter(|s| !s.is_empty()),
        references: from_json::<Vec<String>>(&references_json)?,
        smtp: match smtp_json {
            Some(s) if !s.is_empty() => Some(from_json::<SmtpMetadata>(&s)?),
            _ => None,
        },
        created_at: parse_ts(&created_str),
        updated_at: parse_ts(&updated_str),
    })
}

const OUTBOX_COLUMNS: &str = "id, email_id, owner_id, scheduled_send_time, status, attempts, \
     next_attempt_at, last_error, created_at, updated_at";

fn row_to_outbox_entry(row: &libsql::Row) -> Result<OutboxEntry, StoreError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let email_id_str: String = row.get(1).map_err(query_err)?;
    let scheduled_str: String = row.get(3).map_err(query_err)?;
    let status_str: String = row.get(4).map_err(query_err)?;
    let next_attempt_str: String = row.get(6).map_err(query_err)?;
    let created_str: String = row.get(8).map_err(query_err)?;
    let updated_str: String = row.get(9).map_err(query_err)?;

    Ok(OutboxEntry {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| StoreError::Serialization(format!("bad entry id {id_str}: {e}")))?,
        email_id: Uuid::parse_str(&email_id_str)
            .map_err(|e| StoreError::Serialization(format!("bad email id {email_id_str}: {e}")))?,
        owner_id: row.get(2).map_err(query_err)?,
        scheduled_send_time: parse_ts(&scheduled_str),
        status: DeliveryStatus::parse(&status_str).unwrap_or(DeliveryStatus::Pending),
        attempts: row.get::<i64>(5).map_err(query_err)? as u32,
        next_attempt_at: parse_ts(&next_attempt_str),
        last_error: row.get::<String>(7).ok().filter(|s| !s.is_empty()),
        created_at: parse_ts(&created_str),
        updated_at: parse_ts(&updated_str),
    })
}

const RULE_COLUMNS: &str =
    "id, owner_id, name, is_active, priority, conditions_json, actions_json, created_at, updated_at";

fn row_to_rule(row: &libsql::Row) -> Result<Rule, StoreError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let conditions_json: String = row.get(5).map_err(query_err)?;
    let actions_json: String = row.get(6).map_err(query_err)?;
    let created_str: String = row.get(7).map_err(query_err)?;
    let updated_str: String = row.get(8).map_err(query_err)?;

    Ok(Rule {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| StoreError::Serialization(format!("bad rule id {id_str}: {e}")))?,
        owner_id: row.get(1).map_err(query_err)?,
        name: row.get(2).map_err(query_err)?,
        is_active: row.get::<i64>(3).map_err(query_err)? != 0,
        priority: row.get::<i64>(4).map_err(query_err)? as i32,
        conditions: from_json::<RuleConditions>(&conditions_json)?,
        actions: from_json::<Vec<RuleAction>>(&actions_json)?,
        created_at: parse_ts(&created_str),
        updated_at: parse_ts(&updated_str),
    })
}

const AUTO_REPLY_COLUMNS: &str = "owner_id, is_active, subject, message_template, start_date, \
     end_date, send_only_once, responded_to_json, created_at, updated_at";

fn row_to_auto_reply(row: &libsql::Row) -> Result<AutoReplyConfig, StoreError> {
    let start_str: String = row.get(4).map_err(query_err)?;
    let end_str: Option<String> = row.get(5).ok();
    let responded_json: String = row.get(7).map_err(query_err)?;
    let created_str: String = row.get(8).map_err(query_err)?;
    let updated_str: String = row.get(9).map_err(query_err)?;

    Ok(AutoReplyConfig {
        owner_id: row.get(0).map_err(query_err)?,
        is_active: row.get::<i64>(1).map_err(query_err)? != 0,
        subject: row.get(2).map_err(query_err)?,
        message_template: row.get(3).map_err(query_err)?,
        start_date: parse_ts(&start_str),
        end_date: end_str.filter(|s| !s.is_empty()).map(|s| parse_ts(&s)),
        send_only_once: row.get::<i64>(6).map_err(query_err)? != 0,
        responded_to: from_json::<Vec<String>>(&responded_json)?,
        created_at: parse_ts(&created_str),
        updated_at: parse_ts(&updated_str),
    })
}

fn row_to_user(row: &libsql::Row) -> Result<MailUser, StoreError> {
    Ok(MailUser {
        id: row.get(0).map_err(query_err)?,
        address: row.get(1).map_err(query_err)?,
        display_name: row.get(2).map_err(query_err)?,
        is_active: row.get::<i64>(3).map_err(query_err)? != 0,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl MailStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Emails ──────────────────────────────────────────────────────

    async fn insert_email(&self, email: &Email) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO emails (id, owner_id, message_id, folder, is_read, is_starred, \
                 subject, html_body, plain_body, from_json, to_json, cc_json, bcc_json, \
                 attachments_json, labels_json, thread_id, in_reply_to, references_json, \
                 smtp_json, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                 ?16, ?17, ?18, ?19, ?20, ?21)",
                params![
                    email.id.to_string(),
                    email.owner_id.clone(),
                    email.message_id.clone(),
                    email.folder.as_str(),
                    email.is_read as i64,
                    email.is_starred as i64,
                    email.subject.clone(),
                    email.html_body.clone(),
                    email.plain_body.clone(),
                    to_json(&email.from)?,
                    to_json(&email.to)?,
                    to_json(&email.cc)?,
                    to_json(&email.bcc)?,
                    to_json(&email.attachments)?,
                    to_json(&email.labels)?,
                    email.thread_id.clone(),
                    opt_text(email.in_reply_to.clone()),
                    to_json(&email.references)?,
                    opt_text(email.smtp.as_ref().map(to_json).transpose()?),
                    fmt_ts(email.created_at),
                    fmt_ts(email.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_email(&self, id: Uuid, owner_id: &str) -> Result<Email, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let row = rows
            .next()
            .await
            .map_err(query_err)?
            .ok_or_else(|| not_found("email", id))?;
        let email = row_to_email(&row)?;
        if email.owner_id != owner_id {
            return Err(StoreError::Unauthorized {
                entity: "email".into(),
                id: id.to_string(),
            });
        }
        Ok(email)
    }

    async fn update_email(&self, email: &Email) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE emails SET folder = ?2, is_read = ?3, is_starred = ?4, subject = ?5, \
                 html_body = ?6, plain_body = ?7, to_json = ?8, cc_json = ?9, bcc_json = ?10, \
                 attachments_json = ?11, labels_json = ?12, thread_id = ?13, in_reply_to = ?14, \
                 references_json = ?15, smtp_json = ?16, updated_at = ?17 \
                 WHERE id = ?1 AND owner_id = ?18",
                params![
                    email.id.to_string(),
                    email.folder.as_str(),
                    email.is_read as i64,
                    email.is_starred as i64,
                    email.subject.clone(),
                    email.html_body.clone(),
                    email.plain_body.clone(),
                    to_json(&email.to)?,
                    to_json(&email.cc)?,
                    to_json(&email.bcc)?,
                    to_json(&email.attachments)?,
                    to_json(&email.labels)?,
                    email.thread_id.clone(),
                    opt_text(email.in_reply_to.clone()),
                    to_json(&email.references)?,
                    opt_text(email.smtp.as_ref().map(to_json).transpose()?),
                    fmt_ts(email.updated_at),
                    email.owner_id.clone(),
                ],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(not_found("email", email.id));
        }
        Ok(())
    }

    async fn list_emails(
        &self,
        owner_id: &str,
        folder: Folder,
        limit: usize,
    ) -> Result<Vec<Email>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EMAIL_COLUMNS} FROM emails \
                     WHERE owner_id = ?1 AND folder = ?2 \
                     ORDER BY created_at DESC LIMIT ?3"
                ),
                params![owner_id, folder.as_str(), limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut emails = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            emails.push(row_to_email(&row)?);
        }
        Ok(emails)
    }

    async fn move_email(&self, id: Uuid, owner_id: &str, folder: Folder) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE emails SET folder = ?3, updated_at = ?4 WHERE id = ?1 AND owner_id = ?2",
                params![
                    id.to_string(),
                    owner_id,
                    folder.as_str(),
                    fmt_ts(Utc::now())
                ],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(not_found("email", id));
        }
        Ok(())
    }

    async fn delete_email(&self, id: Uuid, owner_id: &str) -> Result<(), StoreError> {
        // Ownership check first so a mismatch surfaces as Unauthorized.
        let _ = self.get_email(id, owner_id).await?;
        self.conn()
            .execute(
                "DELETE FROM emails WHERE id = ?1 AND owner_id = ?2",
                params![id.to_string(), owner_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn email_exists(&self, owner_id: &str, message_id: &str) -> Result<bool, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM emails WHERE owner_id = ?1 AND message_id = ?2",
                params![owner_id, message_id],
            )
            .await
            .map_err(query_err)?;
        let row = rows.next().await.map_err(query_err)?;
        let count: i64 = row.map(|r| r.get(0)).transpose().map_err(query_err)?.unwrap_or(0);
        Ok(count > 0)
    }

    // ── Outbox ──────────────────────────────────────────────────────

    async fn insert_outbox_entry(&self, entry: &OutboxEntry) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO outbox (id, email_id, owner_id, scheduled_send_time, status, \
                 attempts, next_attempt_at, last_error, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    entry.id.to_string(),
                    entry.email_id.to_string(),
                    entry.owner_id.clone(),
                    fmt_ts(entry.scheduled_send_time),
                    entry.status.as_str(),
                    entry.attempts as i64,
                    fmt_ts(entry.next_attempt_at),
                    opt_text(entry.last_error.clone()),
                    fmt_ts(entry.created_at),
                    fmt_ts(entry.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_outbox_entry(&self, id: Uuid) -> Result<Option<OutboxEntry>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_outbox_entry(&row)?)),
            None => Ok(None),
        }
    }

    async fn due_outbox_entries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let now = fmt_ts(now);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OUTBOX_COLUMNS} FROM outbox \
                     WHERE status = 'pending' AND scheduled_send_time <= ?1 \
                     AND next_attempt_at <= ?1 \
                     ORDER BY scheduled_send_time"
                ),
                params![now],
            )
            .await
            .map_err(query_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            entries.push(row_to_outbox_entry(&row)?);
        }
        Ok(entries)
    }

    async fn claim_outbox_entry(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        // Compare-and-set: only one caller observes the pending row.
        let affected = self
            .conn()
            .execute(
                "UPDATE outbox SET status = 'sending', updated_at = ?2 \
                 WHERE id = ?1 AND status = 'pending' AND scheduled_send_time <= ?2",
                params![id.to_string(), fmt_ts(now)],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    async fn recall_outbox_entry(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        // Strictly before the scheduled time, and only while still pending.
        let affected = self
            .conn()
            .execute(
                "UPDATE outbox SET status = 'recalled', updated_at = ?2 \
                 WHERE id = ?1 AND status = 'pending' AND scheduled_send_time > ?2",
                params![id.to_string(), fmt_ts(now)],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    async fn delete_outbox_entry(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "DELETE FROM outbox WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn retry_outbox_entry(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE outbox SET status = 'pending', attempts = ?2, next_attempt_at = ?3, \
                 last_error = ?4, updated_at = ?5 WHERE id = ?1 AND status = 'sending'",
                params![
                    id.to_string(),
                    attempts as i64,
                    fmt_ts(next_attempt_at),
                    error,
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(not_found("outbox entry", id));
        }
        Ok(())
    }

    async fn fail_outbox_entry(&self, id: Uuid, attempts: u32, error: &str) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE outbox SET status = 'failed', attempts = ?2, last_error = ?3, \
                 updated_at = ?4 WHERE id = ?1",
                params![id.to_string(), attempts as i64, error, fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(not_found("outbox entry", id));
        }
        Ok(())
    }

    async fn list_failed_outbox(&self, owner_id: &str) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OUTBOX_COLUMNS} FROM outbox \
                     WHERE owner_id = ?1 AND status = 'failed' ORDER BY updated_at DESC"
                ),
                params![owner_id],
            )
            .await
            .map_err(query_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            entries.push(row_to_outbox_entry(&row)?);
        }
        Ok(entries)
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO rules (id, owner_id, name, is_active, priority, \
                 conditions_json, actions_json, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    rule.id.to_string(),
                    rule.owner_id.clone(),
                    rule.name.clone(),
                    rule.is_active as i64,
                    rule.priority as i64,
                    to_json(&rule.conditions)?,
                    to_json(&rule.actions)?,
                    fmt_ts(rule.created_at),
                    fmt_ts(rule.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_rule(&self, id: Uuid, owner_id: &str) -> Result<Rule, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let row = rows
            .next()
            .await
            .map_err(query_err)?
            .ok_or_else(|| not_found("rule", id))?;
        let rule = row_to_rule(&row)?;
        if rule.owner_id != owner_id {
            return Err(StoreError::Unauthorized {
                entity: "rule".into(),
                id: id.to_string(),
            });
        }
        Ok(rule)
    }

    async fn list_rules(&self, owner_id: &str) -> Result<Vec<Rule>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules WHERE owner_id = ?1 \
                     ORDER BY priority, id"
                ),
                params![owner_id],
            )
            .await
            .map_err(query_err)?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    async fn delete_rule(&self, id: Uuid, owner_id: &str) -> Result<(), StoreError> {
        let _ = self.get_rule(id, owner_id).await?;
        self.conn()
            .execute(
                "DELETE FROM rules WHERE id = ?1 AND owner_id = ?2",
                params![id.to_string(), owner_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_rule_active(
        &self,
        id: Uuid,
        owner_id: &str,
        active: bool,
    ) -> Result<(), StoreError> {
        let _ = self.get_rule(id, owner_id).await?;
        self.conn()
            .execute(
                "UPDATE rules SET is_active = ?3, updated_at = ?4 \
                 WHERE id = ?1 AND owner_id = ?2",
                params![
                    id.to_string(),
                    owner_id,
                    active as i64,
                    fmt_ts(Utc::now())
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Auto-reply ──────────────────────────────────────────────────

    async fn get_auto_reply(&self, owner_id: &str) -> Result<Option<AutoReplyConfig>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AUTO_REPLY_COLUMNS} FROM auto_replies WHERE owner_id = ?1"),
                params![owner_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_auto_reply(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_auto_reply(&self, config: &AutoReplyConfig) -> Result<(), StoreError> {
        // Owner edits never reset the responded-to list.
        let responded = match self.get_auto_reply(&config.owner_id).await? {
            Some(existing) => existing.responded_to,
            None => config.responded_to.clone(),
        };

        self.conn()
            .execute(
                "INSERT OR REPLACE INTO auto_replies (owner_id, is_active, subject, \
                 message_template, start_date, end_date, send_only_once, responded_to_json, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    config.owner_id.clone(),
                    config.is_active as i64,
                    config.subject.clone(),
                    config.message_template.clone(),
                    fmt_ts(config.start_date),
                    opt_text(config.end_date.map(fmt_ts)),
                    config.send_only_once as i64,
                    to_json(&responded)?,
                    fmt_ts(config.created_at),
                    fmt_ts(config.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_auto_reply_active(&self, owner_id: &str, active: bool) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE auto_replies SET is_active = ?2, updated_at = ?3 WHERE owner_id = ?1",
                params![owner_id, active as i64, fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(not_found("auto-reply config", owner_id));
        }
        Ok(())
    }

    async fn append_responded_to(&self, owner_id: &str, sender: &str) -> Result<(), StoreError> {
        let config = self
            .get_auto_reply(owner_id)
            .await?
            .ok_or_else(|| not_found("auto-reply config", owner_id))?;

        if config.has_responded_to(sender) {
            return Ok(());
        }
        let mut responded = config.responded_to;
        responded.push(sender.to_string());

        self.conn()
            .execute(
                "UPDATE auto_replies SET responded_to_json = ?2, updated_at = ?3 \
                 WHERE owner_id = ?1",
                params![owner_id, to_json(&responded)?, fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn clear_responded_to(&self, owner_id: &str) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE auto_replies SET responded_to_json = '[]', updated_at = ?2 \
                 WHERE owner_id = ?1",
                params![owner_id, fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(not_found("auto-reply config", owner_id));
        }
        Ok(())
    }

    async fn delete_auto_reply(&self, owner_id: &str) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM auto_replies WHERE owner_id = ?1",
                params![owner_id],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(not_found("auto-reply config", owner_id));
        }
        Ok(())
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn find_user_by_address(&self, address: &str) -> Result<Option<MailUser>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, address, display_name, is_active FROM users \
                 WHERE lower(address) = lower(?1)",
                params![address],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_user(&self, id: &str) -> Result<Option<MailUser>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, address, display_name, is_active FROM users WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_user(&self, user: &MailUser) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO users (id, address, display_name, is_active) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(id) DO UPDATE SET address = excluded.address, \
                 display_name = excluded.display_name, is_active = excluded.is_active, \
                 updated_at = datetime('now')",
                params![
                    user.id.clone(),
                    user.address.clone(),
                    user.display_name.clone(),
                    user.is_active as i64
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}
