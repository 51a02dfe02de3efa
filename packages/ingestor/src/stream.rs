//! Socket Stream Source
//!
//! Reads transactions from the indexing service over a Unix socket. Requests
//! and deliveries are newline-delimited JSON. A lost connection is re-opened
//! with exponential backoff and the subscription resumed from the last
//! delivered height.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::codec::split_key_value;
use crate::scanner::TransactionSource;
use crate::types::RawTransaction;

/// Default socket path of the indexing service
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/lockd-stream.sock";

/// Maximum number of reconnection attempts before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Initial backoff delay for reconnection
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff delay for reconnection
pub const MAX_BACKOFF_MS: u64 = 30000;

/// Connection timeout in milliseconds
pub const CONNECTION_TIMEOUT_MS: u64 = 5000;

/// Errors that can occur while reading the transaction stream
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream socket not found at path: {0}")]
    SocketNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout after {0}ms")]
    Timeout(u64),

    #[error("Max reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),

    #[error("Invalid socket path: {0}")]
    InvalidPath(String),

    #[error("Not subscribed")]
    NotSubscribed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration for the stream connection
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Path to the Unix socket, `~` is expanded
    pub socket_path: String,
    /// Maximum reconnection attempts
    pub max_reconnect_attempts: u32,
    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
            timeout_ms: CONNECTION_TIMEOUT_MS,
        }
    }
}

impl StreamConfig {
    /// Create a new config with the specified socket path
    pub fn with_path(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    /// Calculate backoff delay for a given attempt number
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_backoff_ms.saturating_mul(2u64.pow(attempt.min(10)));
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

/// Validate a socket path before connecting
pub fn validate_socket_path(path: &str) -> Result<(), StreamError> {
    if path.trim().is_empty() {
        return Err(StreamError::InvalidPath("Path cannot be empty".to_string()));
    }
    Ok(())
}

/// Request sent to the indexing service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StreamRequest {
    Subscribe {
        #[serde(rename = "fromHeight")]
        from_height: u64,
    },
    Unsubscribe,
}

/// One transaction as delivered on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTransaction {
    pub id: String,
    #[serde(default)]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub block_time: Option<i64>,
    /// Output scripts, hex-encoded
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Key/value pairs as `key=value` strings
    #[serde(default)]
    pub data: Vec<String>,
}

impl StreamTransaction {
    pub fn into_raw(self) -> RawTransaction {
        let pairs = self
            .data
            .iter()
            .map(|entry| {
                let (key, value) = split_key_value(entry);
                (key.to_string(), value.to_string())
            })
            .collect();

        RawTransaction {
            txid: self.id,
            block_height: self.block_height,
            block_time: self.block_time,
            outputs: self.outputs,
            pairs,
        }
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn send(&mut self, request: &StreamRequest) -> Result<(), StreamError> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Transaction source reading from the indexing service socket
pub struct SocketSource {
    config: StreamConfig,
    connection: Option<Connection>,
    reconnect_attempts: u32,
    /// Height the current subscription was opened from
    subscribed_from: Option<u64>,
    /// Height of the last delivered confirmed transaction
    last_height: Option<u64>,
}

impl SocketSource {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            connection: None,
            reconnect_attempts: 0,
            subscribed_from: None,
            last_height: None,
        }
    }

    pub fn with_path(socket_path: impl Into<String>) -> Self {
        Self::new(StreamConfig::with_path(socket_path))
    }

    pub fn socket_path(&self) -> &str {
        &self.config.socket_path
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Height a resumed subscription starts from
    pub fn resume_height(&self) -> Option<u64> {
        self.last_height.or(self.subscribed_from)
    }

    /// Calculate delay before next reconnection attempt
    pub fn next_backoff_delay(&self) -> Duration {
        self.config.backoff_delay(self.reconnect_attempts)
    }

    async fn connect(&mut self) -> Result<Connection, StreamError> {
        validate_socket_path(&self.config.socket_path)?;
        let expanded_path = expand_path(&self.config.socket_path);

        if !Path::new(&expanded_path).exists() {
            return Err(StreamError::SocketNotFound(expanded_path));
        }

        info!(path = %expanded_path, "Connecting to stream socket");

        let stream = timeout(
            Duration::from_millis(self.config.timeout_ms),
            UnixStream::connect(&expanded_path),
        )
        .await
        .map_err(|_| StreamError::Timeout(self.config.timeout_ms))?
        .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;

        let (reader, writer) = stream.into_split();
        Ok(Connection {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    /// Reconnect with exponential backoff and resubscribe
    async fn reconnect(&mut self) -> Result<(), StreamError> {
        self.connection = None;
        let from_height = self.resume_height().ok_or(StreamError::NotSubscribed)?;

        while self.reconnect_attempts < self.config.max_reconnect_attempts {
            let delay = self.next_backoff_delay();
            warn!(
                attempt = self.reconnect_attempts + 1,
                max = self.config.max_reconnect_attempts,
                ?delay,
                "Attempting to reconnect"
            );

            sleep(delay).await;
            self.reconnect_attempts += 1;

            let attempt = async {
                let mut connection = self.connect().await?;
                connection.send(&StreamRequest::Subscribe { from_height }).await?;
                Ok::<_, StreamError>(connection)
            };

            match attempt.await {
                Ok(connection) => {
                    info!(from_height, "Resubscribed to stream");
                    self.connection = Some(connection);
                    self.reconnect_attempts = 0;
                    return Ok(());
                }
                Err(e) => {
                    error!(attempt = self.reconnect_attempts, error = %e, "Reconnection attempt failed");
                }
            }
        }

        Err(StreamError::MaxReconnectAttemptsExceeded(self.config.max_reconnect_attempts))
    }
}

#[async_trait]
impl TransactionSource for SocketSource {
    async fn subscribe(&mut self, from_height: u64) -> Result<(), StreamError> {
        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None => self.connect().await?,
        };
        connection.send(&StreamRequest::Subscribe { from_height }).await?;

        self.connection = Some(connection);
        self.subscribed_from = Some(from_height);
        self.last_height = None;
        self.reconnect_attempts = 0;
        info!(from_height, "Subscribed to stream");
        Ok(())
    }

    async fn next_transaction(&mut self) -> Result<Option<RawTransaction>, StreamError> {
        loop {
            let Some(connection) = self.connection.as_mut() else {
                return Err(StreamError::NotSubscribed);
            };

            match connection.lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StreamTransaction>(&line) {
                        Ok(delivery) => {
                            if delivery.block_height.is_some() {
                                self.last_height = delivery.block_height;
                            }
                            debug!(txid = %delivery.id, height = ?delivery.block_height, "Received transaction");
                            return Ok(Some(delivery.into_raw()));
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed stream line");
                        }
                    }
                }
                Ok(None) => {
                    warn!("Stream connection closed by peer");
                    self.reconnect().await?;
                }
                Err(e) => {
                    warn!(error = %e, "Stream read failed");
                    self.reconnect().await?;
                }
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), StreamError> {
        self.subscribed_from = None;
        if let Some(mut connection) = self.connection.take() {
            connection.send(&StreamRequest::Unsubscribe).await?;
            info!("Unsubscribed from stream");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    // ==================== Config tests ====================

    #[test]
    fn test_stream_config_default() {
        let config = StreamConfig::default();
        assert_eq!(config.socket_path, DEFAULT_SOCKET_PATH);
        assert_eq!(config.max_reconnect_attempts, MAX_RECONNECT_ATTEMPTS);
        assert_eq!(config.initial_backoff_ms, INITIAL_BACKOFF_MS);
        assert_eq!(config.max_backoff_ms, MAX_BACKOFF_MS);
    }

    #[test]
    fn test_stream_config_backoff_delay() {
        let config = StreamConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_stream_config_backoff_delay_caps_at_max() {
        let config = StreamConfig::default();
        assert_eq!(config.backoff_delay(9), Duration::from_millis(30000));
        assert_eq!(config.backoff_delay(100), Duration::from_millis(30000));
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let expanded = expand_path("~/lockd.sock");
        if dirs::home_dir().is_some() {
            assert!(!expanded.starts_with('~'));
            assert!(expanded.ends_with("/lockd.sock"));
        }
    }

    #[test]
    fn test_expand_path_without_tilde() {
        assert_eq!(expand_path("/tmp/lockd.sock"), "/tmp/lockd.sock");
        assert_eq!(expand_path("/tmp/~/lockd.sock"), "/tmp/~/lockd.sock");
    }

    #[test]
    fn test_validate_socket_path_empty() {
        assert!(matches!(validate_socket_path("  "), Err(StreamError::InvalidPath(_))));
        assert!(validate_socket_path("/tmp/lockd.sock").is_ok());
    }

    // ==================== Wire format tests ====================

    #[test]
    fn test_subscribe_request_wire_format() {
        let json = serde_json::to_string(&StreamRequest::Subscribe { from_height: 883000 }).unwrap();
        assert_eq!(json, r#"{"op":"subscribe","fromHeight":883000}"#);
        let json = serde_json::to_string(&StreamRequest::Unsubscribe).unwrap();
        assert_eq!(json, r#"{"op":"unsubscribe"}"#);
    }

    #[test]
    fn test_stream_transaction_into_raw() {
        let delivery: StreamTransaction = serde_json::from_str(
            r#"{"id":"abc","blockHeight":883001,"blockTime":1700000000,
                "outputs":["006a"],"data":["app=lockd.app","content=a=b","flag"]}"#,
        )
        .unwrap();
        let raw = delivery.into_raw();

        assert_eq!(raw.txid, "abc");
        assert_eq!(raw.block_height, Some(883001));
        assert_eq!(raw.outputs, vec!["006a"]);
        assert_eq!(raw.pairs[1], ("content".to_string(), "a=b".to_string()));
        assert_eq!(raw.pairs[2], ("flag".to_string(), String::new()));
    }

    #[test]
    fn test_stream_transaction_optional_fields() {
        let delivery: StreamTransaction = serde_json::from_str(r#"{"id":"mempool"}"#).unwrap();
        let raw = delivery.into_raw();
        assert_eq!(raw.block_height, None);
        assert!(raw.pairs.is_empty());
    }

    // ==================== SocketSource tests ====================

    #[tokio::test]
    async fn test_subscribe_to_missing_socket_fails() {
        let mut source = SocketSource::with_path("/nonexistent/path/lockd.sock");
        let result = source.subscribe(1).await;
        assert!(matches!(result, Err(StreamError::SocketNotFound(_))));
    }

    #[tokio::test]
    async fn test_next_transaction_requires_subscription() {
        let mut source = SocketSource::with_path("/nonexistent/path/lockd.sock");
        assert!(matches!(source.next_transaction().await, Err(StreamError::NotSubscribed)));
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();

            let subscribe = lines.next_line().await.unwrap().unwrap();
            writer
                .write_all(
                    concat!(
                        r#"{"id":"tx1","blockHeight":883000,"data":["app=lockd.app"]}"#,
                        "\n",
                        "not json\n",
                        "\n",
                        r#"{"id":"tx2","blockHeight":883001,"outputs":["006a"]}"#,
                        "\n",
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();

            let unsubscribe = lines.next_line().await.unwrap().unwrap();
            (subscribe, unsubscribe)
        });

        let mut source = SocketSource::with_path(path.to_string_lossy());
        source.subscribe(883000).await.unwrap();

        let first = source.next_transaction().await.unwrap().unwrap();
        assert_eq!(first.txid, "tx1");
        assert_eq!(first.pairs, vec![("app".to_string(), "lockd.app".to_string())]);

        let second = source.next_transaction().await.unwrap().unwrap();
        assert_eq!(second.txid, "tx2");
        assert_eq!(source.resume_height(), Some(883001));

        source.unsubscribe().await.unwrap();

        let (subscribe, unsubscribe) = server.await.unwrap();
        assert_eq!(subscribe, r#"{"op":"subscribe","fromHeight":883000}"#);
        assert_eq!(unsubscribe, r#"{"op":"unsubscribe"}"#);
    }

    #[tokio::test]
    async fn test_closed_connection_without_retries_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closing.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            lines.next_line().await.unwrap();
        });

        let mut config = StreamConfig::with_path(path.to_string_lossy());
        config.max_reconnect_attempts = 0;
        let mut source = SocketSource::new(config);
        source.subscribe(10).await.unwrap();
        server.await.unwrap();

        let result = source.next_transaction().await;
        assert!(matches!(result, Err(StreamError::MaxReconnectAttemptsExceeded(0))));
    }
}
