//! Auto-responder: per-owner config and the reply decision engine.

pub mod engine;

pub use engine::{AutoReplyEngine, ReplyDecision};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-owner auto-reply settings.
///
/// The engine mutates this only two ways: appending to `responded_to`
/// after a successful hand-off, and flipping `is_active` off when the
/// validity window has passed. Everything else is owner-edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoReplyConfig {
    pub owner_id: String,
    pub is_active: bool,
    pub subject: String,
    pub message_template: String,
    pub start_date: DateTime<Utc>,
    /// `None` = open-ended.
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    pub send_only_once: bool,
    /// Sender addresses already replied to (set semantics).
    #[serde(default)]
    pub responded_to: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutoReplyConfig {
    /// A fresh config with the original defaults.
    pub fn new(owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            owner_id: owner_id.into(),
            is_active: true,
            subject: "Out of Office".into(),
            message_template: "I am currently out of office.".into(),
            start_date: now,
            end_date: None,
            send_only_once: true,
            responded_to: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_responded_to(&self, sender: &str) -> bool {
        self.responded_to
            .iter()
            .any(|s| s.eq_ignore_ascii_case(sender))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behavior() {
        let cfg = AutoReplyConfig::new("user-1");
        assert!(cfg.is_active);
        assert!(cfg.send_only_once);
        assert_eq!(cfg.subject, "Out of Office");
        assert!(cfg.end_date.is_none());
        assert!(cfg.responded_to.is_empty());
    }

    #[test]
    fn responded_check_is_case_insensitive() {
        let mut cfg = AutoReplyConfig::new("user-1");
        cfg.responded_to.push("Alice@Example.com".into());
        assert!(cfg.has_responded_to("alice@example.com"));
        assert!(!cfg.has_responded_to("bob@example.com"));
    }
}
