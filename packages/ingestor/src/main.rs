use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lockd_ingestor::{Dispatcher, IngestorConfig, RedisSink, Scanner, SocketSource};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = IngestorConfig::from_env()?;
    info!(
        socket = %config.stream.socket_path,
        redis = %config.redis_url,
        channel = %config.channel,
        "Starting lockd ingestor"
    );

    let client = redis::Client::open(config.redis_url.as_str())?;
    let connection = client.get_multiplexed_async_connection().await?;
    let sink = RedisSink::new(connection, config.channel.clone(), config.key_prefix.clone());

    let source = SocketSource::new(config.stream.clone());
    let dispatcher = Arc::new(Dispatcher::new(config.cache));
    let mut scanner = Scanner::new(source, sink, Arc::clone(&dispatcher), config.scanner);

    let stop = scanner.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            stop.request_stop();
        }
    });

    scanner.start(None).await?;
    let result = scanner.run().await;

    let totals = dispatcher.stats();
    info!(
        parsed = totals.parsed,
        skipped = totals.skipped,
        failed = totals.failed,
        degraded = totals.degraded,
        "Dispatcher totals"
    );

    match result {
        Ok(stats) => {
            info!(received = stats.received, persisted = stats.persisted, "Ingestor stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Ingestor failed");
            Err(e.into())
        }
    }
}
