//! Inbound ingestion: normalizer, pipeline, relay session, mailbox poll.

pub mod imap_poller;
pub mod normalizer;
pub mod pipeline;
pub mod smtp_server;

pub use imap_poller::{PollConfig, spawn_mailbox_poller};
pub use normalizer::{Normalizer, ParsedMessage, parse_wire_message};
pub use pipeline::IngestPipeline;
pub use smtp_server::{RelayConfig, RelayServer};
