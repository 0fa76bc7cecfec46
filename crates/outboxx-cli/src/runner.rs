//! The processor loop: receive a batch of change events, publish every
//! matching (event, stream) pair, flush the broker queue, and only then
//! acknowledge the batch's LSN to PostgreSQL. A withheld acknowledgment is
//! re-covered by the next successful batch, so delivery is at-least-once.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use outboxx_config::{Config, ProcessorConfig};
use outboxx_core::Router;
use outboxx_kafka::{KafkaProducer, MessageProducer, ProducerResult};
use outboxx_pg::{ensure_replication_setup, format_lsn, parse_lsn, ChangeBatch, PostgresSource};

/// Load configuration, wire up the source and producer, and run the loop
/// until a shutdown signal arrives.
pub async fn run(config_path: &Path, start_lsn: Option<&str>) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let conn_string = config.source.connection_string()?;

    let router = Router::new(config.routes());
    let producer = KafkaProducer::new(&config.sink.bootstrap_servers())?;

    ensure_replication_setup(&conn_string, &config.source.slot, &config.source.publication)
        .await?;

    // LSN 0/0 makes the server resume from the slot's confirmed position,
    // which is the only durable resume state this pipeline keeps.
    let start_lsn = match start_lsn {
        Some(text) => parse_lsn(text)?,
        None => 0,
    };
    let mut source = PostgresSource::connect(
        &conn_string,
        &config.source.slot,
        &config.source.publication,
        start_lsn,
    )
    .await?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            flag.store(true, Ordering::Relaxed);
        }
    });

    info!(streams = router.len(), "processor started");
    run_loop(&mut source, &producer, &router, &config.processor, &shutdown).await?;
    info!("processor stopped");
    Ok(())
}

/// Receive → publish → flush → ack until the shutdown flag is set. The flag
/// is checked between iterations, so an in-flight batch always completes its
/// flush-and-ack cycle before the loop exits.
async fn run_loop(
    source: &mut PostgresSource,
    producer: &impl MessageProducer,
    router: &Router,
    settings: &ProcessorConfig,
    shutdown: &AtomicBool,
) -> Result<()> {
    while !shutdown.load(Ordering::Relaxed) {
        debug!(phase = "receiving", "awaiting batch");
        let batch = source
            .receive_batch(settings.batch_size, settings.batch_deadline())
            .await?;

        if let Some(lsn) = publish_and_flush(&batch, router, producer, settings.flush_timeout()) {
            debug!(phase = "acking", lsn = %format_lsn(lsn), "acknowledging batch");
            source.send_feedback(lsn).await?;
        }
    }
    Ok(())
}

/// Publish a batch and flush the producer. Returns the LSN to acknowledge,
/// or `None` when any enqueue or the flush failed; in that case the ack is
/// withheld and a later successful batch covers the range cumulatively.
fn publish_and_flush(
    batch: &ChangeBatch,
    router: &Router,
    producer: &impl MessageProducer,
    flush_timeout: Duration,
) -> Option<u64> {
    debug!(phase = "publishing", events = batch.changes.len(), "dispatching batch");
    let published = publish_batch(batch, router, producer);

    debug!(phase = "flushing", "draining producer queue");
    let flushed = producer.flush(flush_timeout);

    match (published, flushed) {
        (Ok(sent), Ok(())) => {
            if sent > 0 {
                info!(
                    events = batch.changes.len(),
                    records = sent,
                    lsn = %format_lsn(batch.last_lsn),
                    "batch published"
                );
            }
            Some(batch.last_lsn)
        }
        (Err(e), _) => {
            warn!(error = %e, "publish failed, withholding LSN acknowledgment");
            None
        }
        (Ok(_), Err(e)) => {
            warn!(error = %e, "flush failed, withholding LSN acknowledgment");
            None
        }
    }
}

/// Enqueue one record per matching (event, stream) pair, in batch order.
/// Events matching no stream are dropped silently; an event that fails to
/// serialize is logged and skipped; an enqueue failure fails the batch.
fn publish_batch(
    batch: &ChangeBatch,
    router: &Router,
    producer: &impl MessageProducer,
) -> ProducerResult<usize> {
    let mut sent = 0;
    for event in &batch.changes {
        for stream in router.route(event) {
            let payload = match event.to_json() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(stream = %stream.name, error = %e, "failed to serialize event, dropping");
                    continue;
                }
            };
            let key = stream.routing_key_for(event);
            producer.send(&stream.destination, &key, &payload)?;
            sent += 1;
        }
    }
    Ok(sent)
}
