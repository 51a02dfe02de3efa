//! Lockd Ingestor Library
//!
//! This crate provides components for ingesting lockd.app ledger transactions,
//! parsing their embedded protocol data into typed records, and publishing
//! those records to Redis.

pub mod cache;
pub mod codec;
pub mod config;
pub mod content;
pub mod dispatcher;
pub mod error;
pub mod parsers;
pub mod protocol;
pub mod publisher;
pub mod scanner;
pub mod stream;
pub mod types;

// Re-export commonly used types
pub use cache::{CacheConfig, DedupCache};
pub use config::{ConfigError, IngestorConfig};
pub use content::extract_content;
pub use dispatcher::{Dispatcher, ProcessOutcome};
pub use error::ParseError;
pub use publisher::{PublishError, RecordMessage, RedisSink};
pub use scanner::{RecordSink, ScanError, ScanStats, Scanner, ScannerState, StopHandle, TransactionSource};
pub use stream::{SocketSource, StreamError};
pub use types::{ContentKind, ParsedTransaction, Payload, RawTransaction};
