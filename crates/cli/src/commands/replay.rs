use std::path::Path;
use std::sync::Arc;

use leavegate_core::publisher::TracingOutcomePublisher;
use leavegate_core::{
    AdmissionConsumer, AdmissionCoordinator, AdmissionLimits, AdmissionSettings, CapacityPolicy,
    ConsumerSettings, ConsumerSummary, OutcomeFanout, OutcomeOutbox, PublishRetryPolicy,
    ReplayEventSource,
};
use leavegate_db::{SqlDeadLetterSink, SqlIdempotencyLedger, SqlOutcomeOutbox, SqlStateStore};
use tokio::sync::watch;

use crate::commands::{with_database, CommandResult};

/// Runs the stream consumer over a newline-delimited JSON event file until it
/// is drained, against the configured database. Refused outcomes land in the
/// shared outbox for the server's relay to re-drive.
pub fn run(file: &Path) -> CommandResult {
    let result = with_database("replay", |config, pool| async move {
        let source = ReplayEventSource::from_path(file, config.consumer.partitions)
            .await
            .map_err(|error| ("event_source", error.to_string(), 6u8))?;

        let limits = AdmissionLimits::from(&config.admission);
        let outbox = Arc::new(SqlOutcomeOutbox::new(pool.clone()));
        let fanout = OutcomeFanout::new(PublishRetryPolicy::from(&config.publisher))
            .with_publisher(Arc::new(TracingOutcomePublisher))
            .with_outbox(outbox.clone());
        let coordinator = Arc::new(AdmissionCoordinator::new(
            Arc::new(SqlStateStore::new(pool.clone())),
            Arc::new(SqlIdempotencyLedger::new(pool.clone())),
            Arc::new(CapacityPolicy::new(limits)),
            fanout,
            AdmissionSettings::from(&config.admission),
        ));
        let consumer = AdmissionConsumer::new(
            coordinator,
            Arc::new(source),
            Arc::new(SqlDeadLetterSink::new(pool)),
            ConsumerSettings::from(&config),
        );

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let summary = consumer.run(shutdown_rx).await;
        let outbox_pending = outbox
            .pending_count()
            .await
            .map_err(|error| ("outbox", error.to_string(), 3u8))?;
        Ok((summary, outbox_pending))
    });

    match result {
        Ok((summary, outbox_pending)) => summarize(summary, outbox_pending),
        Err(failure) => failure,
    }
}

fn summarize(summary: ConsumerSummary, outbox_pending: u64) -> CommandResult {
    if let Some(error) = &summary.source_error {
        return CommandResult::failure("replay", "event_source", error.clone(), 6);
    }

    let halted = summary.halted_partitions();
    if !halted.is_empty() {
        let partitions = halted.iter().map(u32::to_string).collect::<Vec<_>>().join(", ");
        return CommandResult::failure(
            "replay",
            "partition_halted",
            format!(
                "replay stopped with halted partitions [{partitions}] after {} of {} events",
                summary.acknowledged, summary.received
            ),
            8,
        );
    }

    let message = format!(
        "replayed {} events: {} applied, {} replayed, {} dead-lettered",
        summary.received, summary.applied, summary.replayed, summary.dead_lettered
    );
    match serde_json::to_value(&summary) {
        Ok(mut details) => {
            details["outbox_pending"] = serde_json::Value::from(outbox_pending);
            CommandResult::success_with_details("replay", message, details)
        }
        Err(_) => CommandResult::success("replay", message),
    }
}
