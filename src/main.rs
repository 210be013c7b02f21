use std::sync::Arc;

use anyhow::Context;

use mailroom::autoreply::AutoReplyEngine;
use mailroom::blobs::FsBlobStore;
use mailroom::config::MailroomConfig;
use mailroom::ingest::{IngestPipeline, PollConfig, RelayConfig, RelayServer, spawn_mailbox_poller};
use mailroom::outbox::{Outbox, OutboxScheduler};
use mailroom::service::Mailroom;
use mailroom::store::{LibSqlStore, MailStore};
use mailroom::transport::{SmtpMailer, TransportConfig, TransportSelector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = MailroomConfig::from_env();

    eprintln!("📬 Mailroom v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Grace period: {:?}, sweep every {:?}",
        config.grace_period, config.sweep_interval
    );

    // ── Document store ──────────────────────────────────────────────
    let db_path =
        std::env::var("MAILROOM_DB_PATH").unwrap_or_else(|_| "./data/mailroom.db".to_string());
    let store: Arc<dyn MailStore> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .with_context(|| format!("failed to open database at {db_path}"))?,
    );
    eprintln!("   Database: {db_path}");

    // ── Blob store ──────────────────────────────────────────────────
    let blobs = Arc::new(FsBlobStore::new(
        config.blob_root.clone(),
        config.blob_base_url.clone(),
    ));
    eprintln!("   Blobs: {}", config.blob_root.display());

    // ── Transport ───────────────────────────────────────────────────
    let transport_config =
        TransportConfig::from_env().context("transport configuration required")?;
    eprintln!(
        "   Transports: {} profile(s), relay domain {}",
        transport_config.profiles.len(),
        transport_config.relay_domain
    );
    let selector = TransportSelector::new(transport_config);
    let mailer = Arc::new(SmtpMailer::new(config.transport_timeout));

    // ── Core wiring ─────────────────────────────────────────────────
    let outbox = Arc::new(Outbox::new(Arc::clone(&store), config.grace_period));
    let autoreply = AutoReplyEngine::new(Arc::clone(&store), Arc::clone(&outbox));
    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&store),
        blobs.clone(),
        autoreply,
    ));
    // Facade handed to the (external) route layer.
    let _service = Mailroom::new(Arc::clone(&store), Arc::clone(&outbox));

    // ── Background tasks ────────────────────────────────────────────
    let scheduler = Arc::new(OutboxScheduler::new(
        Arc::clone(&store),
        blobs,
        mailer,
        selector,
        config.clone(),
    ));
    let (_sweep_handle, sweep_shutdown) = scheduler.spawn();

    let mut shutdown_flags = vec![sweep_shutdown];

    if let Some(relay_config) = RelayConfig::from_env() {
        eprintln!(
            "   Relay: {} (allowed domains: {})",
            relay_config.listen_addr,
            if relay_config.allowed_domains.is_empty() {
                "none (deny all)".to_string()
            } else {
                relay_config.allowed_domains.join(", ")
            }
        );
        let relay = Arc::new(RelayServer::new(
            relay_config,
            Arc::clone(&store),
            Arc::clone(&pipeline),
        ));
        let (_relay_handle, relay_shutdown, _addr) = relay.spawn().await?;
        shutdown_flags.push(relay_shutdown);
    } else {
        eprintln!("   Relay: disabled (MAILROOM_SMTP_LISTEN not set)");
    }

    if let Some(poll_config) = PollConfig::from_env() {
        eprintln!(
            "   Poll: {} every {}s",
            poll_config.imap_host, poll_config.poll_interval_secs
        );
        let (_poll_handle, poll_shutdown) =
            spawn_mailbox_poller(poll_config, Arc::clone(&pipeline));
        shutdown_flags.push(poll_shutdown);
    } else {
        eprintln!("   Poll: disabled (MAILROOM_IMAP_HOST not set)");
    }

    eprintln!();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    eprintln!("📪 Shutting down...");
    for flag in &shutdown_flags {
        flag.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    Ok(())
}
