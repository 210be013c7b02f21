//! SMTP delivery via lettre.
//!
//! The blocking `SmtpTransport` runs inside `spawn_blocking`; the whole
//! call is bounded by a timeout, and a timeout is treated like any other
//! transport failure (it counts toward the scheduler's retry bound).

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport as LettreTransport};
use secrecy::ExposeSecret;
use tracing::info;

use crate::error::TransportError;
use crate::transport::{DeliveryReceipt, OutboundMessage, Transport, TransportProfile};

/// Production SMTP transport.
pub struct SmtpMailer {
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Transport for SmtpMailer {
    async fn deliver(
        &self,
        profile: &TransportProfile,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, TransportError> {
        let profile = profile.clone();
        let message = message.clone();
        let timeout = self.timeout;

        let send = tokio::task::spawn_blocking(move || send_blocking(&profile, &message, timeout));

        match tokio::time::timeout(timeout, send).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(TransportError::Send {
                host: "unknown".into(),
                reason: format!("delivery task failed: {join_err}"),
            }),
            Err(_) => Err(TransportError::Timeout { timeout }),
        }
    }
}

fn send_blocking(
    profile: &TransportProfile,
    outbound: &OutboundMessage,
    timeout: Duration,
) -> Result<DeliveryReceipt, TransportError> {
    let message = build_message(outbound)?;

    let builder = if profile.use_tls {
        SmtpTransport::relay(&profile.host).map_err(|e| TransportError::Connect {
            host: profile.host.clone(),
            reason: e.to_string(),
        })?
    } else {
        SmtpTransport::builder_dangerous(&profile.host)
    };

    let mut builder = builder.port(profile.port).timeout(Some(timeout));
    if profile.has_credentials() {
        builder = builder.credentials(Credentials::new(
            profile.username.clone(),
            profile.password.expose_secret().to_string(),
        ));
    }
    let transport = builder.build();

    let response = transport.send(&message).map_err(|e| TransportError::Send {
        host: profile.host.clone(),
        reason: e.to_string(),
    })?;

    info!(
        host = %profile.host,
        message_id = %outbound.message_id,
        "Delivered via SMTP"
    );

    Ok(DeliveryReceipt {
        provider_message_id: outbound.message_id.clone(),
        accepted: outbound.recipient_addresses(),
        rejected: Vec::new(),
        response: response.message().collect::<Vec<_>>().join(" "),
    })
}

/// Build the lettre message from a resolved outbound message.
fn build_message(outbound: &OutboundMessage) -> Result<Message, TransportError> {
    let mut builder = Message::builder()
        .from(parse_mailbox(&outbound.from.email, &outbound.from.name)?)
        .subject(outbound.subject.clone())
        .message_id(Some(outbound.message_id.clone()));

    if let Some(reply_to) = &outbound.reply_to {
        builder = builder.reply_to(parse_mailbox(&reply_to.email, &reply_to.name)?);
    }
    if let Some(in_reply_to) = &outbound.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }
    for to in &outbound.to {
        builder = builder.to(parse_mailbox(&to.email, &to.name)?);
    }
    for cc in &outbound.cc {
        builder = builder.cc(parse_mailbox(&cc.email, &cc.name)?);
    }
    for bcc in &outbound.bcc {
        builder = builder.bcc(parse_mailbox(&bcc.email, &bcc.name)?);
    }

    let alternative = MultiPart::alternative_plain_html(
        outbound.plain_body.clone(),
        if outbound.html_body.is_empty() {
            outbound.plain_body.clone()
        } else {
            outbound.html_body.clone()
        },
    );

    let body = if outbound.attachments.is_empty() {
        alternative
    } else {
        let mut mixed = MultiPart::mixed().multipart(alternative);
        for attachment in &outbound.attachments {
            let content_type = ContentType::parse(&attachment.mime_type)
                .unwrap_or(ContentType::parse("application/octet-stream").expect("static type"));
            mixed = mixed.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.bytes.clone(), content_type),
            );
        }
        mixed
    };

    builder
        .multipart(body)
        .map_err(|e| TransportError::Build(e.to_string()))
}

fn parse_mailbox(email: &str, name: &str) -> Result<Mailbox, TransportError> {
    let address = email
        .parse()
        .map_err(|e| TransportError::InvalidAddress {
            address: email.to_string(),
            reason: format!("{e}"),
        })?;
    let name = if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    };
    Ok(Mailbox::new(name, address))
}
