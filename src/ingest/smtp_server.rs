//! Inbound relay session — a minimal line-based ESMTP listener.
//!
//! Accepts authenticated senders, validates the sending domain against an
//! allow-list, accepts any recipient at the RCPT stage (routing is decided
//! at store time), and hands the parsed message to the ingestion pipeline
//! on data completion. One task per accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, IngestError};
use crate::ingest::normalizer::parse_wire_message;
use crate::ingest::pipeline::IngestPipeline;
use crate::model::domain_of;
use crate::store::MailStore;

/// Default maximum message size: 25 MB.
const DEFAULT_MAX_MESSAGE_BYTES: usize = 25 * 1024 * 1024;

// ── Configuration ───────────────────────────────────────────────────

/// Relay listener configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    /// Sending domains accepted at MAIL FROM. Empty list denies all.
    pub allowed_domains: Vec<String>,
    pub max_message_bytes: usize,
    pub banner: String,
}

impl RelayConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAILROOM_SMTP_LISTEN` is not set (relay disabled).
    pub fn from_env() -> Option<Self> {
        let listen_addr = std::env::var("MAILROOM_SMTP_LISTEN").ok()?;

        let allowed_domains: Vec<String> = std::env::var("MAILROOM_ALLOWED_DOMAINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let max_message_bytes: usize = std::env::var("MAILROOM_SMTP_MAX_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);

        let banner = std::env::var("MAILROOM_SMTP_BANNER")
            .unwrap_or_else(|_| "Mailroom Mail Server".to_string());

        Some(Self {
            listen_addr,
            allowed_domains,
            max_message_bytes,
            banner,
        })
    }

    fn domain_allowed(&self, address: &str) -> bool {
        let domain = domain_of(address);
        self.allowed_domains.iter().any(|d| *d == domain)
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// The inbound relay listener.
pub struct RelayServer {
    config: RelayConfig,
    store: Arc<dyn MailStore>,
    pipeline: Arc<IngestPipeline>,
}

impl RelayServer {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn MailStore>,
        pipeline: Arc<IngestPipeline>,
    ) -> Self {
        Self {
            config,
            store,
            pipeline,
        }
    }

    /// Bind the listener and spawn the accept loop. Returns the handle, a
    /// shutdown flag, and the bound address (useful when listening on an
    /// ephemeral port).
    pub async fn spawn(
        self: Arc<Self>,
    ) -> Result<(JoinHandle<()>, Arc<AtomicBool>, SocketAddr), Error> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| {
                IngestError::Session(format!("bind {} failed: {e}", self.config.listen_addr))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| IngestError::Session(e.to_string()))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(addr = %local_addr, "Relay listener started");

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    info!("Relay listener shutting down");
                    return;
                }

                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_session(stream, peer).await {
                                    debug!(peer = %peer, "Session ended with error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Accept failed: {e}");
                        }
                    },
                    // Re-check the shutdown flag periodically.
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
            }
        });

        Ok((handle, shutdown_flag, local_addr))
    }

    /// Drive one ESMTP session to completion.
    async fn handle_session(&self, stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        debug!(peer = %peer, "Relay session opened");
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_line(&mut writer, &format!("220 {}", self.config.banner)).await?;

        let mut authenticated: Option<String> = None;
        let mut mail_from: Option<String> = None;
        let mut rcpt_count: usize = 0;

        loop {
            let Some(line) = read_line(&mut reader).await? else {
                return Ok(()); // connection closed
            };
            let (verb, rest) = split_verb(&line);

            match verb.as_str() {
                "EHLO" | "HELO" => {
                    write_line(&mut writer, &format!("250-{} greets you", self.config.banner))
                        .await?;
                    write_line(&mut writer, "250-AUTH PLAIN LOGIN").await?;
                    write_line(
                        &mut writer,
                        &format!("250 SIZE {}", self.config.max_message_bytes),
                    )
                    .await?;
                }

                "AUTH" => match self.authenticate(rest, &mut reader, &mut writer).await? {
                    Some(user) => {
                        info!(peer = %peer, user = %user, "Relay sender authenticated");
                        authenticated = Some(user);
                        write_line(&mut writer, "235 2.7.0 Authentication successful").await?;
                    }
                    None => {
                        write_line(&mut writer, "535 5.7.8 Authentication failed").await?;
                    }
                },

                "MAIL" => {
                    if authenticated.is_none() {
                        write_line(&mut writer, "530 5.7.0 Authentication required").await?;
                        continue;
                    }
                    let Some(address) = parse_path(rest) else {
                        write_line(&mut writer, "501 5.1.7 Bad sender address").await?;
                        continue;
                    };
                    if !self.config.domain_allowed(&address) {
                        let err = IngestError::DomainNotAllowed {
                            domain: domain_of(&address),
                        };
                        warn!(peer = %peer, sender = %address, "{err}");
                        write_line(&mut writer, "550 5.7.1 Sender domain not allowed").await?;
                        continue;
                    }
                    mail_from = Some(address);
                    rcpt_count = 0;
                    write_line(&mut writer, "250 2.1.0 OK").await?;
                }

                "RCPT" => {
                    if mail_from.is_none() {
                        write_line(&mut writer, "503 5.5.1 MAIL first").await?;
                        continue;
                    }
                    // Accept anyone; final routing is decided at store time.
                    if parse_path(rest).is_some() {
                        rcpt_count += 1;
                        write_line(&mut writer, "250 2.1.5 OK").await?;
                    } else {
                        write_line(&mut writer, "501 5.1.3 Bad recipient address").await?;
                    }
                }

                "DATA" => {
                    if mail_from.is_none() || rcpt_count == 0 {
                        write_line(&mut writer, "503 5.5.1 RCPT first").await?;
                        continue;
                    }
                    write_line(&mut writer, "354 End data with <CR><LF>.<CR><LF>").await?;

                    match read_data(&mut reader, self.config.max_message_bytes).await? {
                        Some(raw) => match self.ingest(&raw).await {
                            Ok(stored) => {
                                debug!(peer = %peer, stored, "Message accepted");
                                write_line(&mut writer, "250 2.0.0 OK message accepted").await?;
                            }
                            Err(e) => {
                                // Parse/processing failures skip the message,
                                // never the session.
                                warn!(peer = %peer, "Failed to ingest message: {e}");
                                write_line(&mut writer, "451 4.3.0 Processing failed").await?;
                            }
                        },
                        None => {
                            write_line(&mut writer, "552 5.3.4 Message too big").await?;
                        }
                    }
                    mail_from = None;
                    rcpt_count = 0;
                }

                "RSET" => {
                    mail_from = None;
                    rcpt_count = 0;
                    write_line(&mut writer, "250 2.0.0 OK").await?;
                }

                "NOOP" => {
                    write_line(&mut writer, "250 2.0.0 OK").await?;
                }

                "QUIT" => {
                    write_line(&mut writer, "221 2.0.0 Bye").await?;
                    return Ok(());
                }

                _ => {
                    write_line(&mut writer, "500 5.5.2 Command not recognized").await?;
                }
            }
        }
    }

    /// AUTH PLAIN / AUTH LOGIN against the user store.
    async fn authenticate(
        &self,
        rest: &str,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> std::io::Result<Option<String>> {
        let mut parts = rest.split_whitespace();
        let mechanism = parts.next().unwrap_or_default().to_uppercase();

        let username = match mechanism.as_str() {
            "PLAIN" => {
                let payload = match parts.next() {
                    Some(p) => p.to_string(),
                    None => {
                        write_line(writer, "334 ").await?;
                        match read_line(reader).await? {
                            Some(line) => line,
                            None => return Ok(None),
                        }
                    }
                };
                decode_auth_plain(&payload)
            }
            "LOGIN" => {
                write_line(writer, "334 VXNlcm5hbWU6").await?; // "Username:"
                let Some(user_b64) = read_line(reader).await? else {
                    return Ok(None);
                };
                write_line(writer, "334 UGFzc3dvcmQ6").await?; // "Password:"
                let Some(_pass_b64) = read_line(reader).await? else {
                    return Ok(None);
                };
                decode_base64(&user_b64)
            }
            _ => None,
        };

        let Some(username) = username else {
            return Ok(None);
        };

        // Credential verification is the external auth layer's concern;
        // the relay checks the account exists and is active.
        match self.store.find_user_by_address(&username).await {
            Ok(Some(user)) if user.is_active => Ok(Some(username)),
            Ok(Some(_)) => {
                debug!(user = %username, "Rejected auth for disabled account");
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("User lookup failed during auth: {e}");
                Ok(None)
            }
        }
    }

    async fn ingest(&self, raw: &[u8]) -> Result<usize, Error> {
        let parsed = parse_wire_message(raw)?;
        self.pipeline.deliver_to_local_mailboxes(&parsed).await
    }
}

// ── Line protocol helpers ───────────────────────────────────────────

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Read the dot-terminated DATA body. Returns `None` when the size cap is
/// exceeded (the body is still drained to the terminator).
async fn read_data(
    reader: &mut BufReader<OwnedReadHalf>,
    max_bytes: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut body: Vec<u8> = Vec::new();
    let mut oversize = false;

    loop {
        let Some(line) = read_line(reader).await? else {
            return Ok(None);
        };
        if line == "." {
            break;
        }
        // Dot-stuffing: a leading ".." encodes a literal ".".
        let line = if line.starts_with("..") {
            line[1..].to_string()
        } else {
            line
        };

        if body.len() + line.len() + 2 > max_bytes {
            oversize = true;
            continue;
        }
        body.extend_from_slice(line.as_bytes());
        body.extend_from_slice(b"\r\n");
    }

    if oversize { Ok(None) } else { Ok(Some(body)) }
}

/// Extract the address from `FROM:<a@b>` / `TO:<a@b>` arguments.
fn parse_path(rest: &str) -> Option<String> {
    let rest = rest.trim();
    let after_colon = rest.split_once(':').map(|(_, a)| a).unwrap_or(rest).trim();
    let address = match (after_colon.find('<'), after_colon.find('>')) {
        (Some(open), Some(close)) if close > open => &after_colon[open + 1..close],
        _ => after_colon.split_whitespace().next().unwrap_or_default(),
    };
    let address = address.trim();
    if address.contains('@') {
        Some(address.to_lowercase())
    } else {
        None
    }
}

fn split_verb(line: &str) -> (String, &str) {
    match line.split_once(' ') {
        Some((verb, rest)) => (verb.to_uppercase(), rest),
        None => (line.to_uppercase(), ""),
    }
}

fn decode_base64(input: &str) -> Option<String> {
    BASE64
        .decode(input.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// RFC 4616 PLAIN: `authzid \0 authcid \0 password` — we want the authcid.
fn decode_auth_plain(payload: &str) -> Option<String> {
    let decoded = decode_base64(payload)?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    if authcid.is_empty() {
        None
    } else {
        Some(authcid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;

    use super::*;

    #[test]
    fn parse_path_variants() {
        assert_eq!(
            parse_path("FROM:<bob@example.com>"),
            Some("bob@example.com".into())
        );
        assert_eq!(
            parse_path("TO:<Alice@Example.COM> SIZE=123"),
            Some("alice@example.com".into())
        );
        assert_eq!(parse_path("FROM:bob@example.com"), Some("bob@example.com".into()));
        assert_eq!(parse_path("FROM:<>"), None);
        assert_eq!(parse_path("FROM:<no-at-sign>"), None);
    }

    #[test]
    fn auth_plain_decoding() {
        // "\0alice@example.com\0secret"
        let payload = BASE64.encode(b"\0alice@example.com\0secret");
        assert_eq!(
            decode_auth_plain(&payload),
            Some("alice@example.com".into())
        );
        assert_eq!(decode_auth_plain("not-base64!"), None);
    }

    #[test]
    fn domain_allowlist() {
        let config = RelayConfig {
            listen_addr: "127.0.0.1:0".into(),
            allowed_domains: vec!["local.test".into()],
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            banner: "test".into(),
        };
        assert!(config.domain_allowed("bob@local.test"));
        assert!(config.domain_allowed("bob@LOCAL.TEST"));
        assert!(!config.domain_allowed("bob@evil.test"));
    }

    #[test]
    fn empty_allowlist_denies_all() {
        let config = RelayConfig {
            listen_addr: "127.0.0.1:0".into(),
            allowed_domains: vec![],
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            banner: "test".into(),
        };
        assert!(!config.domain_allowed("bob@anywhere.test"));
    }

    #[test]
    fn split_verb_uppercases() {
        assert_eq!(split_verb("ehlo client"), ("EHLO".into(), "client"));
        assert_eq!(split_verb("QUIT"), ("QUIT".into(), ""));
    }
}
