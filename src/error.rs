//! Error types for the mail processing core.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Document-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Unauthorized access to {entity} {id}")]
    Unauthorized { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Malformed-request errors. Rejected synchronously, never retried.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid rule {name}: {message}")]
    InvalidRule { name: String, message: String },

    #[error("Invalid email address: {0}")]
    InvalidAddress(String),
}

/// Errors raised while accepting or normalizing inbound mail.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Sender domain not allowed: {domain}")]
    DomainNotAllowed { domain: String },

    #[error("Failed to parse message: {0}")]
    Parse(String),

    /// Expected under overlapping poll windows — discarded, never surfaced.
    #[error("Duplicate message {message_id} for owner {owner_id}")]
    DuplicateMessage { message_id: String, owner_id: String },

    #[error("Session error: {0}")]
    Session(String),
}

/// Outbound delivery errors. Retried up to a bound, then surfaced as a
/// terminal failed entry.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No transport profile for domain {domain} and no relay fallback")]
    NoProfile { domain: String },

    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Delivery to {host} failed: {reason}")]
    Send { host: String, reason: String },

    #[error("Delivery timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

/// Attachment blob-store errors.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Failed to write blob {id}: {reason}")]
    Write { id: String, reason: String },

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the core.
pub type Result<T> = std::result::Result<T, Error>;
