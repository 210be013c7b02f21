//! Periodic mailbox poll — fetches unseen messages from a configured
//! remote mailbox and feeds them through the ingestion pipeline.
//!
//! The IMAP client is a minimal blocking line protocol over rustls, run
//! inside `spawn_blocking`. Each cycle: SEARCH UNSEEN → FETCH RFC822 →
//! parse + store → mark \Seen. Dedup against stored Message-IDs (in the
//! normalizer) guards overlapping poll runs and relay/poll overlap. A
//! message that fails to parse is skipped, never the batch.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ingest::normalizer::parse_wire_message;
use crate::ingest::pipeline::IngestPipeline;

// ── Configuration ───────────────────────────────────────────────────

/// Remote-mailbox poll configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    pub poll_interval_secs: u64,
}

impl PollConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAILROOM_IMAP_HOST` is not set (poll disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("MAILROOM_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("MAILROOM_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("MAILROOM_IMAP_USER").unwrap_or_default();
        let password =
            SecretString::from(std::env::var("MAILROOM_IMAP_PASSWORD").unwrap_or_default());

        let poll_interval_secs: u64 = std::env::var("MAILROOM_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(120);

        Some(Self {
            imap_host,
            imap_port,
            username,
            password,
            poll_interval_secs,
        })
    }
}

// ── Poll loop ───────────────────────────────────────────────────────

/// Spawn the background poll task. Returns a `JoinHandle` and a shutdown
/// flag; set the flag to stop polling.
pub fn spawn_mailbox_poller(
    config: PollConfig,
    pipeline: Arc<IngestPipeline>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            "Mailbox poll started — every {}s on {}",
            config.poll_interval_secs, config.imap_host
        );

        let mut tick = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Mailbox poll shutting down");
                return;
            }

            poll_once(&config, &pipeline).await;
        }
    });

    (handle, shutdown_flag)
}

/// Run a single poll cycle: fetch unseen → ingest → mark \Seen.
async fn poll_once(config: &PollConfig, pipeline: &Arc<IngestPipeline>) {
    let cfg = config.clone();
    let fetch_result = tokio::task::spawn_blocking(move || fetch_unseen(&cfg)).await;

    let messages = match fetch_result {
        Ok(Ok(msgs)) => msgs,
        Ok(Err(e)) => {
            error!("Mailbox poll failed: {e}");
            return;
        }
        Err(e) => {
            error!("Mailbox poll task panicked: {e}");
            return;
        }
    };

    if messages.is_empty() {
        return;
    }
    debug!("Fetched {} unseen message(s)", messages.len());

    let mut uids_to_mark: Vec<String> = Vec::new();

    for (uid, raw) in &messages {
        // Parse failures skip the message, not the batch.
        let parsed = match parse_wire_message(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(uid = %uid, "Skipping unparseable message: {e}");
                uids_to_mark.push(uid.clone());
                continue;
            }
        };

        match pipeline.deliver_to_local_mailboxes(&parsed).await {
            Ok(stored) => {
                debug!(uid = %uid, stored, "Polled message processed");
                uids_to_mark.push(uid.clone());
            }
            Err(e) => {
                // Leave unseen — retried next cycle, dedup guards repeats.
                error!(uid = %uid, "Failed to process polled message: {e}");
            }
        }
    }

    if !uids_to_mark.is_empty() {
        let cfg = config.clone();
        let uids = uids_to_mark;
        let marked = tokio::task::spawn_blocking(move || mark_seen(&cfg, &uids))
            .await
            .unwrap_or_else(|e| Err(e.to_string().into()));
        if let Err(e) = marked {
            warn!("Failed to mark messages seen: {e}");
        }
    }
}

// ── Blocking IMAP client ────────────────────────────────────────────

type ImapError = Box<dyn std::error::Error + Send + Sync>;
type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn connect(config: &PollConfig) -> Result<TlsStream, ImapError> {
    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name: rustls::pki_types::ServerName<'_> =
        rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

fn read_response_line(tls: &mut TlsStream) -> Result<String, ImapError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err("IMAP connection closed".into()),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send_command(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, ImapError> {
    let full = format!("{tag} {cmd}\r\n");
    IoWrite::write_all(tls, full.as_bytes())?;
    IoWrite::flush(tls)?;
    let mut lines = Vec::new();
    loop {
        let line = read_response_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

fn login(tls: &mut TlsStream, config: &PollConfig) -> Result<(), ImapError> {
    let _greeting = read_response_line(tls)?;
    let login_resp = send_command(
        tls,
        "A1",
        &format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }
    let _select = send_command(tls, "A2", "SELECT \"INBOX\"")?;
    Ok(())
}

/// Fetch unseen messages as `(uid, raw RFC822 bytes)` pairs.
fn fetch_unseen(config: &PollConfig) -> Result<Vec<(String, Vec<u8>)>, ImapError> {
    let mut tls = connect(config)?;
    login(&mut tls, config)?;

    let search_resp = send_command(&mut tls, "A3", "SEARCH UNSEEN")?;
    let mut uids: Vec<String> = Vec::new();
    for line in &search_resp {
        if line.starts_with("* SEARCH") {
            uids.extend(line.split_whitespace().skip(2).map(str::to_string));
        }
    }

    let mut results = Vec::new();
    let mut tag_counter = 4_u32;

    for uid in &uids {
        let tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_command(&mut tls, &tag, &format!("FETCH {uid} RFC822"))?;

        // The message body sits between the untagged FETCH line and the
        // closing paren + tagged OK.
        if fetch_resp.len() > 2 {
            let raw: String = fetch_resp[1..fetch_resp.len() - 2].concat();
            results.push((uid.clone(), raw.into_bytes()));
        }
    }

    let tag = format!("A{tag_counter}");
    let _ = send_command(&mut tls, &tag, "LOGOUT");
    Ok(results)
}

/// Mark processed messages `\Seen`.
fn mark_seen(config: &PollConfig, uids: &[String]) -> Result<(), ImapError> {
    let mut tls = connect(config)?;
    login(&mut tls, config)?;

    let mut tag_counter = 3_u32;
    for uid in uids {
        let tag = format!("A{tag_counter}");
        tag_counter += 1;
        send_command(&mut tls, &tag, &format!("STORE {uid} +FLAGS (\\Seen)"))?;
    }

    let tag = format!("A{tag_counter}");
    let _ = send_command(&mut tls, &tag, "LOGOUT");
    Ok(())
}
