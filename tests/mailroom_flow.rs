//! End-to-end flows over an in-memory store: submit → recall/sweep →
//! deliver, inbound ingestion through rules and auto-reply, and the relay
//! session command flow.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use mailroom::autoreply::{AutoReplyConfig, AutoReplyEngine};
use mailroom::blobs::FsBlobStore;
use mailroom::config::MailroomConfig;
use mailroom::error::TransportError;
use mailroom::ingest::normalizer::ParsedMessage;
use mailroom::ingest::{IngestPipeline, RelayConfig, RelayServer};
use mailroom::model::{Address, ComposeRequest, Folder, MailUser};
use mailroom::outbox::{DeliveryStatus, Outbox, OutboxScheduler};
use mailroom::rules::{
    Clause, MatchType, Rule, RuleAction, RuleConditions, RuleField, RuleOperator,
};
use mailroom::service::Mailroom;
use mailroom::store::{LibSqlStore, MailStore};
use mailroom::transport::{
    DeliveryReceipt, OutboundMessage, Transport, TransportConfig, TransportProfile,
    TransportSelector,
};

// ── Test fixtures ───────────────────────────────────────────────────

/// Captures deliveries instead of speaking SMTP; can be told to fail.
struct MockTransport {
    sent: tokio::sync::Mutex<Vec<OutboundMessage>>,
    fail: AtomicBool,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: tokio::sync::Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    async fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn deliver(
        &self,
        profile: &TransportProfile,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, TransportError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(TransportError::Send {
                host: profile.host.clone(),
                reason: "mock failure".into(),
            });
        }
        self.sent.lock().await.push(message.clone());
        Ok(DeliveryReceipt {
            provider_message_id: message.message_id.clone(),
            accepted: message.recipient_addresses(),
            rejected: vec![],
            response: "250 2.0.0 OK".into(),
        })
    }
}

fn profile(domain: &str, validated: bool) -> TransportProfile {
    TransportProfile {
        domain: domain.into(),
        host: format!("smtp.{domain}"),
        port: 587,
        use_tls: true,
        username: format!("relay@{domain}"),
        password: SecretString::from("secret".to_string()),
        validated,
    }
}

fn selector() -> TransportSelector {
    TransportSelector::new(TransportConfig {
        relay_domain: "relay.test".into(),
        profiles: vec![profile("relay.test", true), profile("verified.test", true)],
    })
}

struct Harness {
    store: Arc<dyn MailStore>,
    scheduler: Arc<OutboxScheduler>,
    pipeline: Arc<IngestPipeline>,
    service: Mailroom,
    transport: Arc<MockTransport>,
    _blob_dir: tempfile::TempDir,
}

/// Build the full stack with an in-memory store and a mock transport.
/// `grace` = 0 makes submissions immediately due for the sweep.
async fn harness(grace: Duration) -> Harness {
    let store: Arc<dyn MailStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let blob_dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(FsBlobStore::new(
        blob_dir.path().to_path_buf(),
        "file:///blobs",
    ));
    let transport = MockTransport::new();

    let config = MailroomConfig {
        grace_period: grace,
        sweep_interval: Duration::from_secs(10),
        max_delivery_attempts: 2,
        retry_backoff: Duration::ZERO,
        transport_timeout: Duration::from_secs(5),
        ..MailroomConfig::default()
    };

    let outbox = Arc::new(Outbox::new(Arc::clone(&store), grace));
    let scheduler = Arc::new(OutboxScheduler::new(
        Arc::clone(&store),
        blobs.clone(),
        transport.clone(),
        selector(),
        config,
    ));
    let autoreply = AutoReplyEngine::new(Arc::clone(&store), Arc::clone(&outbox));
    let pipeline = Arc::new(IngestPipeline::new(Arc::clone(&store), blobs, autoreply));
    let service = Mailroom::new(Arc::clone(&store), Arc::clone(&outbox));

    Harness {
        store,
        scheduler,
        pipeline,
        service,
        transport,
        _blob_dir: blob_dir,
    }
}

async fn add_user(store: &Arc<dyn MailStore>, id: &str, address: &str, name: &str) -> MailUser {
    let user = MailUser {
        id: id.into(),
        address: address.into(),
        display_name: name.into(),
        is_active: true,
    };
    store.upsert_user(&user).await.unwrap();
    user
}

fn compose_to(to: &str) -> ComposeRequest {
    ComposeRequest {
        to: vec![Address::bare(to)],
        subject: "Hello".into(),
        html_body: "<p>Hi</p>".into(),
        ..ComposeRequest::default()
    }
}

fn inbound_from(sender: &str, message_id: &str, recipient: &str) -> ParsedMessage {
    ParsedMessage {
        message_id: Some(message_id.into()),
        from: Address::new(sender, ""),
        to: vec![Address::bare(recipient)],
        subject: Some("Inbound".into()),
        text_body: Some("hello".into()),
        ..ParsedMessage::default()
    }
}

// ── Outbox: recall race and delivery ────────────────────────────────

#[tokio::test]
async fn recall_within_grace_moves_to_drafts() {
    let h = harness(Duration::from_secs(30)).await;
    let owner = add_user(&h.store, "u1", "alice@verified.test", "Alice").await;

    let entry_id = h
        .service
        .submit_for_delivery(compose_to("b@b.com"), &owner.id)
        .await
        .unwrap();

    // Recall well inside the 30s grace window.
    let outcome = h.service.recall(entry_id, &owner.id).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status, DeliveryStatus::Recalled);

    // No entry remains in the outbox; the record lives in Drafts.
    assert!(h.store.get_outbox_entry(entry_id).await.unwrap().is_none());
    let drafts = h.store.list_emails(&owner.id, Folder::Drafts, 10).await.unwrap();
    assert_eq!(drafts.len(), 1);
    let outbox_folder = h.store.list_emails(&owner.id, Folder::Outbox, 10).await.unwrap();
    assert!(outbox_folder.is_empty());

    // Nothing was ever delivered.
    let stats = h.scheduler.sweep_once().await;
    assert_eq!(stats.claimed, 0);
    assert!(h.transport.sent_messages().await.is_empty());
}

#[tokio::test]
async fn recall_after_sweep_claim_fails_and_email_is_sent() {
    let h = harness(Duration::ZERO).await;
    let owner = add_user(&h.store, "u1", "alice@verified.test", "Alice").await;

    let entry_id = h
        .service
        .submit_for_delivery(compose_to("b@b.com"), &owner.id)
        .await
        .unwrap();

    // The sweep claims and delivers first.
    let stats = h.scheduler.sweep_once().await;
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.sent, 1);

    // Recall arrives too late and must report failure.
    let outcome = h.service.recall(entry_id, &owner.id).await;
    match outcome {
        Ok(o) => assert!(!o.success),
        // The entry row is deleted once sent; not-found is the same answer.
        Err(e) => assert!(e.to_string().contains("not found"), "{e}"),
    }

    let sent = h.store.list_emails(&owner.id, Folder::Sent, 10).await.unwrap();
    assert_eq!(sent.len(), 1);
    let metadata = sent[0].smtp.as_ref().expect("transport receipt recorded");
    assert_eq!(metadata.accepted, vec!["b@b.com".to_string()]);
    assert_eq!(h.transport.sent_messages().await.len(), 1);
}

#[tokio::test]
async fn recall_by_non_owner_is_unauthorized() {
    let h = harness(Duration::from_secs(30)).await;
    let owner = add_user(&h.store, "u1", "alice@verified.test", "Alice").await;
    add_user(&h.store, "u2", "mallory@verified.test", "Mallory").await;

    let entry_id = h
        .service
        .submit_for_delivery(compose_to("b@b.com"), &owner.id)
        .await
        .unwrap();

    let err = h.service.recall(entry_id, "u2").await.unwrap_err();
    assert!(err.to_string().contains("Unauthorized"), "{err}");
}

#[tokio::test]
async fn failed_delivery_retries_then_goes_terminal() {
    let h = harness(Duration::ZERO).await;
    let owner = add_user(&h.store, "u1", "alice@verified.test", "Alice").await;
    h.transport.fail.store(true, Ordering::Relaxed);

    let entry_id = h
        .service
        .submit_for_delivery(compose_to("b@b.com"), &owner.id)
        .await
        .unwrap();

    // Attempt 1: reverts to pending with the attempt recorded.
    let stats = h.scheduler.sweep_once().await;
    assert_eq!(stats.failed, 1);
    let entry = h.store.get_outbox_entry(entry_id).await.unwrap().unwrap();
    assert_eq!(entry.status, DeliveryStatus::Pending);
    assert_eq!(entry.attempts, 1);
    assert!(entry.last_error.is_some());

    // Attempt 2 hits the bound (max 2): terminal failed, user-visible.
    h.scheduler.sweep_once().await;
    let failed = h.service.list_failed_deliveries(&owner.id).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 2);

    // Terminal entries are not swept again.
    let stats = h.scheduler.sweep_once().await;
    assert_eq!(stats.claimed, 0);
}

#[tokio::test]
async fn relay_rewrite_for_unvalidated_domain() {
    let h = harness(Duration::ZERO).await;
    // No profile exists for unverified.test.
    let owner = add_user(&h.store, "u1", "bob@unverified.test", "Bob").await;

    h.service
        .submit_for_delivery(compose_to("x@y.com"), &owner.id)
        .await
        .unwrap();
    h.scheduler.sweep_once().await;

    let sent = h.transport.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from.email, "bob@relay.test");
    assert_eq!(sent[0].from.name, "Bob");
    assert_eq!(
        sent[0].reply_to.as_ref().map(|a| a.email.as_str()),
        Some("bob@unverified.test")
    );
}

#[tokio::test]
async fn validated_domain_keeps_original_from() {
    let h = harness(Duration::ZERO).await;
    let owner = add_user(&h.store, "u1", "alice@verified.test", "Alice").await;

    h.service
        .submit_for_delivery(compose_to("x@y.com"), &owner.id)
        .await
        .unwrap();
    h.scheduler.sweep_once().await;

    let sent = h.transport.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from.email, "alice@verified.test");
    assert!(sent[0].reply_to.is_none());
}

#[tokio::test]
async fn sweep_does_not_deliver_before_grace() {
    let h = harness(Duration::from_secs(30)).await;
    let owner = add_user(&h.store, "u1", "alice@verified.test", "Alice").await;

    h.service
        .submit_for_delivery(compose_to("b@b.com"), &owner.id)
        .await
        .unwrap();

    let stats = h.scheduler.sweep_once().await;
    assert_eq!(stats.claimed, 0);
    assert!(h.transport.sent_messages().await.is_empty());
}

// ── Ingestion: dedup, rules, auto-reply ─────────────────────────────

#[tokio::test]
async fn duplicate_message_id_stored_once() {
    let h = harness(Duration::from_secs(30)).await;
    let owner = add_user(&h.store, "u1", "alice@local.test", "Alice").await;

    let parsed = inbound_from("x@remote.test", "<m1@remote.test>", "alice@local.test");
    let first = h.pipeline.process_inbound(&parsed, &owner).await.unwrap();
    assert!(first.is_some());

    // Re-fetch of the same message (relay/poll overlap) is discarded.
    let second = h.pipeline.process_inbound(&parsed, &owner).await.unwrap();
    assert!(second.is_none());

    let inbox = h.store.list_emails(&owner.id, Folder::Inbox, 10).await.unwrap();
    assert_eq!(inbox.len(), 1);
}

#[tokio::test]
async fn rule_precedence_last_write_wins() {
    let h = harness(Duration::from_secs(30)).await;
    let owner = add_user(&h.store, "u1", "alice@local.test", "Alice").await;

    let make_rule = |priority: i32, folder: Folder| Rule {
        id: Uuid::new_v4(),
        owner_id: owner.id.clone(),
        name: format!("move-{priority}"),
        is_active: true,
        priority,
        conditions: RuleConditions {
            match_type: MatchType::All,
            clauses: vec![Clause {
                field: RuleField::From,
                operator: RuleOperator::Contains,
                value: "newsletter".into(),
            }],
        },
        actions: vec![RuleAction::MoveToFolder(folder)],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    h.service.upsert_rule(make_rule(1, Folder::Trash)).await.unwrap();
    h.service.upsert_rule(make_rule(2, Folder::Spam)).await.unwrap();

    let parsed = inbound_from("news@newsletter.com", "<n1@newsletter.com>", "alice@local.test");
    h.pipeline.process_inbound(&parsed, &owner).await.unwrap();

    // Priority 2 runs later and wins.
    let spam = h.store.list_emails(&owner.id, Folder::Spam, 10).await.unwrap();
    assert_eq!(spam.len(), 1);
    assert!(h.store.list_emails(&owner.id, Folder::Trash, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn rule_scenario_newsletter_filter() {
    let h = harness(Duration::from_secs(30)).await;
    let owner = add_user(&h.store, "u1", "alice@local.test", "Alice").await;

    h.service
        .upsert_rule(Rule {
            id: Uuid::new_v4(),
            owner_id: owner.id.clone(),
            name: "Newsletter filter".into(),
            is_active: true,
            priority: 1,
            conditions: RuleConditions {
                match_type: MatchType::All,
                clauses: vec![Clause {
                    field: RuleField::From,
                    operator: RuleOperator::Contains,
                    value: "newsletter".into(),
                }],
            },
            actions: vec![
                RuleAction::MoveToFolder(Folder::Spam),
                RuleAction::AddLabel("promotions".into()),
                RuleAction::MarkAsRead,
            ],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let parsed = inbound_from("news@newsletter.com", "<n2@newsletter.com>", "alice@local.test");
    h.pipeline.process_inbound(&parsed, &owner).await.unwrap();

    let stored = &h.store.list_emails(&owner.id, Folder::Spam, 10).await.unwrap()[0];
    assert_eq!(stored.labels, vec!["promotions".to_string()]);
    assert!(stored.is_read);
}

#[tokio::test]
async fn auto_reply_dedup_sends_exactly_once() {
    let h = harness(Duration::ZERO).await;
    let owner = add_user(&h.store, "u1", "alice@local.test", "Alice").await;
    h.service
        .upsert_auto_reply(AutoReplyConfig::new(owner.id.as_str()))
        .await
        .unwrap();

    let first = inbound_from("x@y.com", "<m1@y.com>", "alice@local.test");
    let second = inbound_from("x@y.com", "<m2@y.com>", "alice@local.test");
    h.pipeline.process_inbound(&first, &owner).await.unwrap();
    h.pipeline.process_inbound(&second, &owner).await.unwrap();

    // Exactly one reply queued, sender recorded exactly once.
    let due = h.store.due_outbox_entries(Utc::now()).await.unwrap();
    assert_eq!(due.len(), 1);
    let config = h.service.get_auto_reply(&owner.id).await.unwrap().unwrap();
    assert_eq!(config.responded_to, vec!["x@y.com".to_string()]);

    // The queued reply actually delivers, threaded to the inbound message.
    h.scheduler.sweep_once().await;
    let sent = h.transport.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to[0].email, "x@y.com");
    assert_eq!(sent[0].in_reply_to.as_deref(), Some("<m1@y.com>"));
    assert_eq!(sent[0].subject, "Out of Office");
}

#[tokio::test]
async fn auto_reply_skips_no_reply_senders() {
    let h = harness(Duration::ZERO).await;
    let owner = add_user(&h.store, "u1", "alice@local.test", "Alice").await;
    h.service
        .upsert_auto_reply(AutoReplyConfig::new(owner.id.as_str()))
        .await
        .unwrap();

    let parsed = inbound_from("no-reply@vendor.com", "<v1@vendor.com>", "alice@local.test");
    h.pipeline.process_inbound(&parsed, &owner).await.unwrap();

    // Inbound stored, but no reply queued and no sender recorded.
    assert_eq!(h.store.list_emails(&owner.id, Folder::Inbox, 10).await.unwrap().len(), 1);
    assert!(h.store.due_outbox_entries(Utc::now()).await.unwrap().is_empty());
    let config = h.service.get_auto_reply(&owner.id).await.unwrap().unwrap();
    assert!(config.responded_to.is_empty());
}

#[tokio::test]
async fn auto_reply_window_self_expires() {
    let h = harness(Duration::ZERO).await;
    let owner = add_user(&h.store, "u1", "alice@local.test", "Alice").await;

    let mut config = AutoReplyConfig::new(owner.id.as_str());
    config.start_date = Utc::now() - chrono::Duration::days(14);
    config.end_date = Some(Utc::now() - chrono::Duration::days(7));
    h.service.upsert_auto_reply(config).await.unwrap();

    let parsed = inbound_from("x@y.com", "<m3@y.com>", "alice@local.test");
    h.pipeline.process_inbound(&parsed, &owner).await.unwrap();

    assert!(h.store.due_outbox_entries(Utc::now()).await.unwrap().is_empty());
    let config = h.service.get_auto_reply(&owner.id).await.unwrap().unwrap();
    assert!(!config.is_active, "config should have deactivated itself");
}

#[tokio::test]
async fn inbound_fans_out_to_each_local_mailbox() {
    let h = harness(Duration::from_secs(30)).await;
    add_user(&h.store, "u1", "alice@local.test", "Alice").await;
    add_user(&h.store, "u2", "carol@local.test", "Carol").await;

    let parsed = ParsedMessage {
        message_id: Some("<fan@remote.test>".into()),
        from: Address::bare("x@remote.test"),
        to: vec![
            Address::bare("alice@local.test"),
            Address::bare("nobody@local.test"),
        ],
        cc: vec![Address::bare("carol@local.test")],
        subject: Some("Fan-out".into()),
        text_body: Some("hello all".into()),
        ..ParsedMessage::default()
    };

    let stored = h.pipeline.deliver_to_local_mailboxes(&parsed).await.unwrap();
    assert_eq!(stored, 2);
    assert_eq!(h.store.list_emails("u1", Folder::Inbox, 10).await.unwrap().len(), 1);
    assert_eq!(h.store.list_emails("u2", Folder::Inbox, 10).await.unwrap().len(), 1);
}

// ── Service contracts ───────────────────────────────────────────────

#[tokio::test]
async fn submit_requires_known_active_user() {
    let h = harness(Duration::from_secs(30)).await;

    let err = h
        .service
        .submit_for_delivery(compose_to("b@b.com"), "ghost")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"), "{err}");

    let mut disabled = add_user(&h.store, "u9", "off@verified.test", "Off").await;
    disabled.is_active = false;
    h.store.upsert_user(&disabled).await.unwrap();
    let err = h
        .service
        .submit_for_delivery(compose_to("b@b.com"), "u9")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unauthorized"), "{err}");
}

#[tokio::test]
async fn invalid_rule_rejected_at_save_time() {
    let h = harness(Duration::from_secs(30)).await;
    let rule = Rule {
        id: Uuid::new_v4(),
        owner_id: "u1".into(),
        name: String::new(),
        is_active: true,
        priority: 0,
        conditions: RuleConditions {
            match_type: MatchType::All,
            clauses: vec![],
        },
        actions: vec![],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let err = h.service.upsert_rule(rule).await.unwrap_err();
    assert!(err.to_string().contains("Validation"), "{err}");
}

#[tokio::test]
async fn toggle_rule_and_auto_reply_flip_state() {
    let h = harness(Duration::from_secs(30)).await;
    let owner = add_user(&h.store, "u1", "alice@local.test", "Alice").await;

    let rule = h
        .service
        .upsert_rule(Rule {
            id: Uuid::new_v4(),
            owner_id: owner.id.clone(),
            name: "toggle me".into(),
            is_active: true,
            priority: 0,
            conditions: RuleConditions {
                match_type: MatchType::Any,
                clauses: vec![Clause {
                    field: RuleField::Subject,
                    operator: RuleOperator::Exists,
                    value: String::new(),
                }],
            },
            actions: vec![RuleAction::MarkAsRead],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    assert!(!h.service.toggle_rule(rule.id, &owner.id).await.unwrap());
    assert!(h.service.toggle_rule(rule.id, &owner.id).await.unwrap());

    h.service
        .upsert_auto_reply(AutoReplyConfig::new(owner.id.as_str()))
        .await
        .unwrap();
    assert!(!h.service.toggle_auto_reply(&owner.id).await.unwrap());
    assert!(h.service.toggle_auto_reply(&owner.id).await.unwrap());
}

// ── Relay session ───────────────────────────────────────────────────

struct SmtpClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl SmtpClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    /// Read a (possibly multi-line) reply, returning the final line.
    async fn read_reply(&mut self) -> String {
        loop {
            let line = self.read_line().await;
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return line;
            }
        }
    }
}

async fn spawn_relay(h: &Harness) -> (std::net::SocketAddr, Arc<AtomicBool>) {
    let relay = Arc::new(RelayServer::new(
        RelayConfig {
            listen_addr: "127.0.0.1:0".into(),
            allowed_domains: vec!["local.test".into()],
            max_message_bytes: 1024 * 1024,
            banner: "Mailroom Test".into(),
        },
        Arc::clone(&h.store),
        Arc::clone(&h.pipeline),
    ));
    let (_handle, shutdown, addr) = relay.spawn().await.unwrap();
    (addr, shutdown)
}

#[tokio::test]
async fn relay_session_stores_mail_for_local_recipient() {
    let h = harness(Duration::from_secs(30)).await;
    add_user(&h.store, "u1", "alice@local.test", "Alice").await;
    add_user(&h.store, "u2", "bob@local.test", "Bob").await;
    let (addr, shutdown) = spawn_relay(&h).await;

    let mut client = SmtpClient::connect(addr).await;
    assert!(client.read_line().await.starts_with("220"));

    client.send("EHLO client.test").await;
    assert!(client.read_reply().await.starts_with("250"));

    let credentials = BASE64.encode(b"\0bob@local.test\0password");
    client.send(&format!("AUTH PLAIN {credentials}")).await;
    assert!(client.read_line().await.starts_with("235"));

    client.send("MAIL FROM:<bob@local.test>").await;
    assert!(client.read_line().await.starts_with("250"));

    client.send("RCPT TO:<alice@local.test>").await;
    assert!(client.read_line().await.starts_with("250"));

    client.send("DATA").await;
    assert!(client.read_line().await.starts_with("354"));
    client.send("Message-ID: <relay-1@local.test>").await;
    client.send("From: Bob <bob@local.test>").await;
    client.send("To: Alice <alice@local.test>").await;
    client.send("Subject: Over the wire").await;
    client.send("").await;
    client.send("Hello from the relay session.").await;
    client.send(".").await;
    assert!(client.read_line().await.starts_with("250"));

    client.send("QUIT").await;
    assert!(client.read_line().await.starts_with("221"));

    let inbox = h.store.list_emails("u1", Folder::Inbox, 10).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].subject, "Over the wire");
    assert_eq!(inbox[0].from.email, "bob@local.test");

    shutdown.store(true, Ordering::Relaxed);
}

#[tokio::test]
async fn relay_rejects_disallowed_sender_domain() {
    let h = harness(Duration::from_secs(30)).await;
    add_user(&h.store, "u2", "bob@local.test", "Bob").await;
    let (addr, shutdown) = spawn_relay(&h).await;

    let mut client = SmtpClient::connect(addr).await;
    client.read_line().await;
    client.send("EHLO client.test").await;
    client.read_reply().await;

    let credentials = BASE64.encode(b"\0bob@local.test\0password");
    client.send(&format!("AUTH PLAIN {credentials}")).await;
    assert!(client.read_line().await.starts_with("235"));

    client.send("MAIL FROM:<intruder@evil.test>").await;
    assert!(client.read_line().await.starts_with("550"));

    shutdown.store(true, Ordering::Relaxed);
}

#[tokio::test]
async fn relay_requires_authentication_before_mail() {
    let h = harness(Duration::from_secs(30)).await;
    let (addr, shutdown) = spawn_relay(&h).await;

    let mut client = SmtpClient::connect(addr).await;
    client.read_line().await;
    client.send("EHLO client.test").await;
    client.read_reply().await;

    client.send("MAIL FROM:<bob@local.test>").await;
    assert!(client.read_line().await.starts_with("530"));

    shutdown.store(true, Ordering::Relaxed);
}
