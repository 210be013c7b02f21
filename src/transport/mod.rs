//! Outbound transport: per-domain profiles, deterministic selection with
//! relay fallback, and the delivery trait the scheduler drives.

pub mod smtp;

pub use smtp::SmtpMailer;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::{ConfigError, TransportError};
use crate::model::{Address, domain_of, local_part_of};

// ── Profiles ────────────────────────────────────────────────────────

/// Per sending-domain SMTP configuration. Read-only to the core; supplied
/// by configuration, never created at runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportProfile {
    pub domain: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default = "empty_secret")]
    pub password: SecretString,
    #[serde(default)]
    pub validated: bool,
}

fn default_true() -> bool {
    true
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

impl TransportProfile {
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.expose_secret().is_empty()
    }

    /// Usable for direct (non-relay) sending.
    pub fn is_usable(&self) -> bool {
        self.validated && self.has_credentials()
    }
}

/// Transport configuration: all profiles plus the always-configured relay
/// domain used as the fallback route.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub relay_domain: String,
    pub profiles: Vec<TransportProfile>,
}

impl TransportConfig {
    /// Build from `MAILROOM_RELAY_DOMAIN` plus `MAILROOM_TRANSPORTS`
    /// (inline JSON array) or `MAILROOM_TRANSPORTS_FILE` (path to the same
    /// JSON).
    pub fn from_env() -> Result<Self, ConfigError> {
        let relay_domain =
            std::env::var("MAILROOM_RELAY_DOMAIN").map_err(|_| ConfigError::MissingRequired {
                key: "MAILROOM_RELAY_DOMAIN".into(),
                hint: "set it to the always-configured relay sending domain".into(),
            })?;

        let raw = match std::env::var("MAILROOM_TRANSPORTS") {
            Ok(json) => json,
            Err(_) => {
                let path = std::env::var("MAILROOM_TRANSPORTS_FILE").map_err(|_| {
                    ConfigError::MissingRequired {
                        key: "MAILROOM_TRANSPORTS".into(),
                        hint: "provide transport profiles as JSON, inline or via \
                               MAILROOM_TRANSPORTS_FILE"
                            .into(),
                    }
                })?;
                std::fs::read_to_string(path)?
            }
        };

        let profiles: Vec<TransportProfile> = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("transport profiles: {e}")))?;

        let config = Self {
            relay_domain,
            profiles,
        };
        if config.profile_for(&config.relay_domain).is_none() {
            return Err(ConfigError::InvalidValue {
                key: "MAILROOM_RELAY_DOMAIN".into(),
                message: format!("no transport profile for relay domain {}", config.relay_domain),
            });
        }
        Ok(config)
    }

    pub fn profile_for(&self, domain: &str) -> Option<&TransportProfile> {
        self.profiles
            .iter()
            .find(|p| p.domain.eq_ignore_ascii_case(domain))
    }
}

// ── Selection ───────────────────────────────────────────────────────

/// Header rewrite applied when falling back to the relay: `From` becomes an
/// address at the relay domain, `Reply-To` the original owner address, so
/// replies still route correctly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRewrite {
    pub from: Address,
    pub reply_to: Address,
}

/// A selected delivery route.
#[derive(Debug, Clone)]
pub struct SelectedRoute {
    pub profile: TransportProfile,
    pub rewrite: Option<RelayRewrite>,
}

/// Deterministic per-domain route selection. No retry logic of its own —
/// retries are the scheduler's responsibility.
#[derive(Debug, Clone)]
pub struct TransportSelector {
    config: TransportConfig,
}

impl TransportSelector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Select the route for an owner's sending address. A validated profile
    /// with credentials sends as the owner; anything else falls back to the
    /// relay with a `From`/`Reply-To` rewrite.
    pub fn select(&self, owner: &Address) -> Result<SelectedRoute, TransportError> {
        let domain = domain_of(&owner.email);

        if let Some(profile) = self.config.profile_for(&domain)
            && profile.is_usable()
        {
            return Ok(SelectedRoute {
                profile: profile.clone(),
                rewrite: None,
            });
        }

        let relay = self
            .config
            .profile_for(&self.config.relay_domain)
            .ok_or_else(|| TransportError::NoProfile {
                domain: domain.clone(),
            })?;

        let relay_from = Address::new(
            format!(
                "{}@{}",
                local_part_of(&owner.email),
                self.config.relay_domain
            ),
            owner.name.clone(),
        );

        Ok(SelectedRoute {
            profile: relay.clone(),
            rewrite: Some(RelayRewrite {
                from: relay_from,
                reply_to: owner.clone(),
            }),
        })
    }
}

// ── Delivery ────────────────────────────────────────────────────────

/// One attachment's bytes, resolved from the blob store for sending.
#[derive(Debug, Clone)]
pub struct OutboundAttachment {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// A fully-resolved outbound message, ready for the wire.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub from: Address,
    pub reply_to: Option<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    pub html_body: String,
    pub plain_body: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub attachments: Vec<OutboundAttachment>,
}

impl OutboundMessage {
    /// Apply a relay rewrite to the wire headers.
    pub fn apply_rewrite(&mut self, rewrite: &RelayRewrite) {
        self.from = rewrite.from.clone();
        self.reply_to = Some(rewrite.reply_to.clone());
    }

    /// Every envelope recipient address.
    pub fn recipient_addresses(&self) -> Vec<String> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(|a| a.email.clone())
            .collect()
    }
}

/// Transport receipt for a delivered message.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub response: String,
}

/// Wire delivery seam. The production implementation is [`SmtpMailer`];
/// tests substitute a mock.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        profile: &TransportProfile,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, TransportError>;
}
