//! Scanner
//!
//! Drives the ingest loop: pulls transactions from a [`TransactionSource`],
//! parses them with the [`Dispatcher`] and hands the records to a
//! [`RecordSink`]. Completed blocks are checkpointed so a restart resumes
//! where the previous run left off.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, ProcessOutcome};
use crate::publisher::PublishError;
use crate::stream::StreamError;
use crate::types::{ParsedTransaction, RawTransaction};

/// Default first block height scanned when nothing else is known
pub const DEFAULT_START_HEIGHT: u64 = 883_000;

/// Upstream delivery of raw transactions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionSource: Send {
    /// Open a subscription starting at `from_height`
    async fn subscribe(&mut self, from_height: u64) -> Result<(), StreamError>;

    /// Wait for the next transaction; `None` once the stream has ended
    async fn next_transaction(&mut self) -> Result<Option<RawTransaction>, StreamError>;

    async fn unsubscribe(&mut self) -> Result<(), StreamError>;
}

/// Destination of parsed records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordSink: Send {
    /// Store a record; persisting the same transaction twice is an upsert
    async fn persist(&mut self, record: &ParsedTransaction) -> Result<(), PublishError>;

    /// Record `height` as the last fully processed block
    async fn save_checkpoint(&mut self, _height: u64) -> Result<(), PublishError> {
        Ok(())
    }

    async fn last_checkpoint(&mut self) -> Result<Option<u64>, PublishError> {
        Ok(None)
    }
}

/// Errors returned by scanner lifecycle operations
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ScannerState,
    },

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Lifecycle state of a scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScannerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ScannerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Tracks block completion for checkpointing
///
/// Deliveries arrive in height order. A block is complete once a transaction
/// from a later block is seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Block currently being delivered
    pub current: Option<u64>,
    /// Last block known to be fully processed
    pub completed: Option<u64>,
    /// Earliest block holding a record the sink failed to store
    pub failed: Option<u64>,
}

impl Cursor {
    /// Observe a delivery at `height`
    ///
    /// # Returns
    /// The height of a block completed by this delivery, if any
    pub fn observe(&mut self, height: u64) -> Option<u64> {
        match self.current {
            Some(current) if height > current => {
                self.current = Some(height);
                if self.failed.is_some_and(|failed| failed <= current) {
                    return None;
                }
                self.completed = Some(current);
                Some(current)
            }
            Some(_) => None,
            None => {
                self.current = Some(height);
                None
            }
        }
    }

    /// Height to resume from after the last completed block
    pub fn next_block(&self) -> Option<u64> {
        self.completed.map(|height| height.saturating_add(1))
    }

    /// Note a record at `height` that the sink failed to store
    ///
    /// A block with an unstored record is never reported complete, so a
    /// restart replays it from the last checkpoint.
    pub fn mark_failed(&mut self, height: u64) {
        self.failed = Some(self.failed.map_or(height, |failed| failed.min(height)));
    }

    /// Forget the in-progress block, keeping the completed and failed ones
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Counters for one scan run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub received: u64,
    pub persisted: u64,
    pub skipped: u64,
    /// Transactions the dispatcher rejected
    pub failed: u64,
    pub persist_failures: u64,
    pub checkpoints: u64,
}

/// Cloneable handle requesting a running scanner to stop
#[derive(Debug, Clone)]
pub struct StopHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask the scanner to stop after the transaction in progress
    pub fn request_stop(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.sender.borrow()
    }
}

/// Scanner configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannerConfig {
    /// Height used when no explicit start, checkpoint or cursor is available
    pub default_start_height: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            default_start_height: DEFAULT_START_HEIGHT,
        }
    }
}

/// Ingest loop over a source and a sink
pub struct Scanner<S, P> {
    source: S,
    sink: P,
    dispatcher: Arc<Dispatcher>,
    config: ScannerConfig,
    state: ScannerState,
    cursor: Cursor,
    stop_tx: Arc<watch::Sender<bool>>,
    stats: ScanStats,
}

impl<S, P> Scanner<S, P>
where
    S: TransactionSource,
    P: RecordSink,
{
    pub fn new(source: S, sink: P, dispatcher: Arc<Dispatcher>, config: ScannerConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            source,
            sink,
            dispatcher,
            config,
            state: ScannerState::Stopped,
            cursor: Cursor::default(),
            stop_tx: Arc::new(stop_tx),
            stats: ScanStats::default(),
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sink(&self) -> &P {
        &self.sink
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            sender: Arc::clone(&self.stop_tx),
        }
    }

    fn set_state(&mut self, state: ScannerState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "Scanner state changed");
            self.state = state;
        }
    }

    /// Start height: explicit, then sink checkpoint, then cursor, then default
    async fn resolve_start_height(&mut self, from_height: Option<u64>) -> u64 {
        if let Some(height) = from_height {
            return height;
        }

        match self.sink.last_checkpoint().await {
            Ok(Some(checkpoint)) => return checkpoint.saturating_add(1),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read checkpoint, falling back"),
        }

        self.cursor
            .next_block()
            .unwrap_or(self.config.default_start_height)
    }

    /// Subscribe to the source and enter `Running`
    ///
    /// # Returns
    /// The height the subscription was opened from
    pub async fn start(&mut self, from_height: Option<u64>) -> Result<u64, ScanError> {
        if self.state != ScannerState::Stopped {
            return Err(ScanError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        self.set_state(ScannerState::Starting);
        let height = self.resolve_start_height(from_height).await;

        match self.source.subscribe(height).await {
            Ok(()) => {
                self.cursor.reset();
                self.stats = ScanStats::default();
                self.set_state(ScannerState::Running);
                info!(height, "Scanner started");
                Ok(height)
            }
            Err(e) => {
                error!(height, error = %e, "Subscription failed");
                self.set_state(ScannerState::Stopped);
                Err(ScanError::Stream(e))
            }
        }
    }

    /// Process deliveries until the stream ends or a stop is requested
    ///
    /// A stop request is honored between transactions only.
    pub async fn run(&mut self) -> Result<ScanStats, ScanError> {
        if self.state != ScannerState::Running {
            return Err(ScanError::InvalidState {
                operation: "run",
                state: self.state,
            });
        }

        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow_and_update() {
                info!("Stop requested");
                break;
            }

            let delivery = tokio::select! {
                _ = stop_rx.changed() => continue,
                delivery = self.source.next_transaction() => delivery,
            };

            match delivery {
                Ok(Some(raw)) => self.handle(raw).await,
                Ok(None) => {
                    info!("Stream ended");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Stream failed");
                    self.stop().await?;
                    return Err(ScanError::Stream(e));
                }
            }
        }

        self.stop().await?;
        info!(
            received = self.stats.received,
            persisted = self.stats.persisted,
            skipped = self.stats.skipped,
            failed = self.stats.failed,
            "Scan finished"
        );
        Ok(self.stats)
    }

    async fn handle(&mut self, raw: RawTransaction) {
        self.stats.received += 1;

        if let Some(completed) = raw.block_height.and_then(|height| self.cursor.observe(height)) {
            match self.sink.save_checkpoint(completed).await {
                Ok(()) => {
                    self.stats.checkpoints += 1;
                    debug!(height = completed, "Checkpointed block");
                }
                Err(e) => error!(height = completed, error = %e, "Failed to checkpoint"),
            }
        }

        match self.dispatcher.process(&raw) {
            Ok(ProcessOutcome::Parsed(record)) => match self.sink.persist(&record).await {
                Ok(()) => self.stats.persisted += 1,
                Err(e) => {
                    self.stats.persist_failures += 1;
                    error!(txid = %record.txid, error = %e, "Failed to persist record");
                    if let Some(height) = raw.block_height.or(self.cursor.current) {
                        self.cursor.mark_failed(height);
                    }
                }
            },
            Ok(ProcessOutcome::Skipped) => self.stats.skipped += 1,
            Err(e) => {
                self.stats.failed += 1;
                warn!(txid = %raw.txid, error = %e, "Dropping transaction");
            }
        }
    }

    /// Unsubscribe and return to `Stopped`; a no-op when already stopped
    pub async fn stop(&mut self) -> Result<(), ScanError> {
        if self.state == ScannerState::Stopped {
            return Ok(());
        }

        self.set_state(ScannerState::Stopping);
        let result = self.source.unsubscribe().await;
        self.stop_tx.send_replace(false);
        self.set_state(ScannerState::Stopped);

        result.map_err(|e| {
            warn!(error = %e, "Unsubscribe failed");
            ScanError::Stream(e)
        })
    }
}
