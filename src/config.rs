//! Core configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Timing and storage configuration for the processing core.
///
/// Subsystem wire configs (relay listener, mailbox poll, transport
/// profiles) live with their subsystems and are built via `from_env`
/// there; this struct carries the knobs shared across the core.
#[derive(Debug, Clone)]
pub struct MailroomConfig {
    /// Grace period between submission and delivery, during which the
    /// sender may recall the message.
    pub grace_period: Duration,
    /// Outbox sweep interval.
    pub sweep_interval: Duration,
    /// Maximum delivery attempts before an entry goes terminal-failed.
    pub max_delivery_attempts: u32,
    /// Base backoff between delivery attempts (scaled by attempt count).
    pub retry_backoff: Duration,
    /// Bound on a single transport call; a timeout counts as a failure.
    pub transport_timeout: Duration,
    /// Attachment blob root directory.
    pub blob_root: PathBuf,
    /// Public base URL under which stored blobs are fetchable.
    pub blob_base_url: String,
}

impl Default for MailroomConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            max_delivery_attempts: 3,
            retry_backoff: Duration::from_secs(60),
            transport_timeout: Duration::from_secs(30),
            blob_root: PathBuf::from("./data/blobs"),
            blob_base_url: "file:///data/blobs".to_string(),
        }
    }
}

impl MailroomConfig {
    /// Build config from `MAILROOM_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            grace_period: env_secs("MAILROOM_GRACE_SECS", defaults.grace_period),
            sweep_interval: env_secs("MAILROOM_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            max_delivery_attempts: std::env::var("MAILROOM_MAX_DELIVERY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_delivery_attempts),
            retry_backoff: env_secs("MAILROOM_RETRY_BACKOFF_SECS", defaults.retry_backoff),
            transport_timeout: env_secs("MAILROOM_TRANSPORT_TIMEOUT_SECS", defaults.transport_timeout),
            blob_root: std::env::var("MAILROOM_BLOB_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.blob_root),
            blob_base_url: std::env::var("MAILROOM_BLOB_BASE_URL")
                .unwrap_or(defaults.blob_base_url),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
