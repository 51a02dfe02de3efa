//! Redis Record Sink
//!
//! Stores parsed transactions in Redis keyed by transaction id and announces
//! each one on a pub/sub channel. The scan checkpoint lives alongside them.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::scanner::RecordSink;
use crate::types::{ContentKind, ParsedTransaction};

/// Default Redis channel for published records
pub const DEFAULT_CHANNEL: &str = "lockd_records";

/// Default prefix for every key written by the sink
pub const DEFAULT_KEY_PREFIX: &str = "lockd";

/// Errors that can occur during publishing
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Record format stored in and published to Redis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordMessage {
    #[serde(flatten)]
    pub record: ParsedTransaction,
    pub content_kind: ContentKind,
    /// Unix timestamp in milliseconds when the record was published
    pub received_at: i64,
}

impl RecordMessage {
    pub fn from_parsed(record: &ParsedTransaction) -> Self {
        Self {
            content_kind: record.content_kind(),
            record: record.clone(),
            received_at: current_timestamp_millis(),
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Key under which a record is stored
pub fn record_key(prefix: &str, txid: &str) -> String {
    format!("{prefix}:tx:{txid}")
}

/// Key holding the last completed block height
pub fn checkpoint_key(prefix: &str) -> String {
    format!("{prefix}:checkpoint")
}

/// Redis-backed record sink
pub struct RedisSink {
    connection: MultiplexedConnection,
    channel: String,
    key_prefix: String,
}

impl RedisSink {
    /// Create a new sink with a Redis connection
    ///
    /// # Arguments
    /// * `connection` - An established Redis multiplexed connection
    /// * `channel` - The pub/sub channel name to publish to
    /// * `key_prefix` - Prefix for record and checkpoint keys
    pub fn new(
        connection: MultiplexedConnection,
        channel: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            channel: channel.into(),
            key_prefix: key_prefix.into(),
        }
    }

    /// Create a new sink with the default channel and key prefix
    pub fn with_defaults(connection: MultiplexedConnection) -> Self {
        Self::new(connection, DEFAULT_CHANNEL, DEFAULT_KEY_PREFIX)
    }

    /// Store and announce a pre-formatted message
    ///
    /// The upsert and the publish run as one atomic pipeline, so a record is
    /// never announced without being stored. Re-persisting the same
    /// transaction overwrites its key.
    pub async fn publish_message(&mut self, message: &RecordMessage) -> Result<(), PublishError> {
        let json = message.to_json()?;
        let key = record_key(&self.key_prefix, &message.record.txid);

        let _: () = redis::pipe()
            .atomic()
            .set(&key, &json)
            .ignore()
            .publish(&self.channel, &json)
            .ignore()
            .query_async(&mut self.connection)
            .await?;

        debug!(txid = %message.record.txid, key = %key, "Persisted record");
        Ok(())
    }

    /// Get the channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }
}

#[async_trait]
impl RecordSink for RedisSink {
    async fn persist(&mut self, record: &ParsedTransaction) -> Result<(), PublishError> {
        self.publish_message(&RecordMessage::from_parsed(record)).await
    }

    async fn save_checkpoint(&mut self, height: u64) -> Result<(), PublishError> {
        let _: () = self
            .connection
            .set(checkpoint_key(&self.key_prefix), height)
            .await?;
        Ok(())
    }

    async fn last_checkpoint(&mut self) -> Result<Option<u64>, PublishError> {
        let height: Option<u64> = self.connection.get(checkpoint_key(&self.key_prefix)).await?;
        Ok(height)
    }
}
