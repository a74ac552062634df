use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionCoordinator, AdmissionError, Backoff, FailureDisposition};
use crate::consumer::source::{EventSource, StreamRecord};
use crate::consumer::ConsumerStats;
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::domain::event::LeaveEvent;
use crate::store::StoreError;

/// Why a partition worker stopped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerExit {
    /// The dispatcher closed the channel after the source was drained.
    Drained,
    ShutDown,
    /// The store already breaks the capacity invariant; nothing more is decided here.
    Halted { offset: u64, reason: String },
    /// The event at the head kept failing past the retry limit.
    Stalled { offset: u64, error_class: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerRetry {
    pub limit: u32,
    pub backoff: Backoff,
}

enum Step {
    Next,
    Exit(WorkerExit),
}

/// Processes one partition strictly in order. An event is acknowledged only
/// once its outcome is durable or it has been parked as malformed.
pub struct PartitionWorker {
    partition: u32,
    coordinator: Arc<AdmissionCoordinator>,
    source: Arc<dyn EventSource>,
    dead_letters: Arc<dyn DeadLetterSink>,
    stats: Arc<ConsumerStats>,
    retry: WorkerRetry,
}

impl PartitionWorker {
    pub fn new(
        partition: u32,
        coordinator: Arc<AdmissionCoordinator>,
        source: Arc<dyn EventSource>,
        dead_letters: Arc<dyn DeadLetterSink>,
        stats: Arc<ConsumerStats>,
        retry: WorkerRetry,
    ) -> Self {
        Self { partition, coordinator, source, dead_letters, stats, retry }
    }

    pub async fn run(
        self,
        mut records: mpsc::Receiver<StreamRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) -> WorkerExit {
        loop {
            if *shutdown.borrow() {
                return self.stopped();
            }
            let record = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => return self.stopped(),
                record = records.recv() => record,
            };
            let Some(record) = record else {
                debug!(event_name = "consumer.partition.drained", partition = self.partition, "partition drained");
                return WorkerExit::Drained;
            };

            match self.process(&record, &mut shutdown).await {
                Step::Next => {}
                Step::Exit(exit) => return exit,
            }
        }
    }

    async fn process(&self, record: &StreamRecord, shutdown: &mut watch::Receiver<bool>) -> Step {
        let decoded = LeaveEvent::decode(&record.payload).map_err(AdmissionError::from);
        let request_id = decoded.as_ref().map(|event| event.request_id.as_str()).unwrap_or("-");

        let mut failures = 0_u32;
        let mut parked = false;
        loop {
            let handled = match &decoded {
                Ok(event) => self.coordinator.handle(event).await,
                Err(malformed) => Err(malformed.clone()),
            };
            let failure = match handled {
                Ok(report) => {
                    self.stats.record_disposition(report.disposition);
                    self.acknowledge(record).await;
                    if parked {
                        self.resolve(record).await;
                    }
                    return Step::Next;
                }
                Err(failure) => failure,
            };
            let event = decoded.as_ref().ok();

            let failure = match failure.disposition() {
                FailureDisposition::DeadLetterAndAcknowledge => {
                    match self.park(record, event, &failure).await {
                        Ok(()) => {
                            self.acknowledge(record).await;
                            return Step::Next;
                        }
                        // Acknowledging now would lose the payload.
                        Err(sink_error) => AdmissionError::TransientStore(sink_error),
                    }
                }
                FailureDisposition::HaltPartition => {
                    // The record stays unacknowledged whether or not parking worked.
                    let _ = self.park(record, event, &failure).await;
                    error!(
                        event_name = "consumer.partition.halted",
                        partition = self.partition,
                        offset = record.offset,
                        request_id,
                        error = %failure,
                        "capacity invariant breach observed, partition stopped"
                    );
                    return Step::Exit(WorkerExit::Halted {
                        offset: record.offset,
                        reason: failure.to_string(),
                    });
                }
                FailureDisposition::DeadLetterAndRetry => {
                    parked |= self.park(record, event, &failure).await.is_ok();
                    failure
                }
                FailureDisposition::RetryUnacknowledged => failure,
            };

            failures += 1;
            self.stats.record_retry();
            if failures > self.retry.limit {
                error!(
                    event_name = "consumer.partition.stalled",
                    partition = self.partition,
                    offset = record.offset,
                    request_id,
                    failures,
                    error = %failure,
                    "event still failing after the retry limit, partition stopped"
                );
                return Step::Exit(WorkerExit::Stalled {
                    offset: record.offset,
                    error_class: failure.error_class().to_string(),
                });
            }

            let delay = self.retry.backoff.jittered(failures - 1);
            warn!(
                event_name = "consumer.event.retry",
                partition = self.partition,
                offset = record.offset,
                request_id,
                error_class = failure.error_class(),
                failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure,
                "event left unacknowledged, retrying"
            );
            if !self.wait(delay, shutdown).await {
                return Step::Exit(self.stopped());
            }
        }
    }

    /// Sleeps for `delay` unless shutdown arrives first.
    async fn wait(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown_requested(shutdown) => false,
        }
    }

    async fn acknowledge(&self, record: &StreamRecord) {
        match self.source.acknowledge(record).await {
            Ok(()) => self.stats.record_ack(),
            Err(ack_error) => warn!(
                event_name = "consumer.event.ack_failed",
                partition = self.partition,
                offset = record.offset,
                error = %ack_error,
                "acknowledgement failed, record will be redelivered"
            ),
        }
    }

    async fn park(
        &self,
        record: &StreamRecord,
        event: Option<&LeaveEvent>,
        failure: &AdmissionError,
    ) -> Result<(), StoreError> {
        let mut letter = DeadLetter::new(
            DeadLetter::stream_id(record.partition, record.offset),
            record.payload_text(),
            failure.error_class(),
            failure.to_string(),
            Utc::now(),
        )
        .at_position(record.partition, record.offset);
        if let Some(event) = event {
            letter = letter.for_request(event.request_id.as_str(), event.employee_id.as_str());
        }

        match self.dead_letters.record(letter).await {
            Ok(()) => {
                self.stats.record_dead_letter();
                warn!(
                    event_name = "consumer.event.dead_lettered",
                    partition = record.partition,
                    offset = record.offset,
                    error_class = failure.error_class(),
                    error = %failure,
                    "event parked for review"
                );
                Ok(())
            }
            Err(sink_error) => {
                error!(
                    event_name = "dead_letter.record.failed",
                    partition = record.partition,
                    offset = record.offset,
                    error_class = failure.error_class(),
                    error = %sink_error,
                    "could not park failed event, leaving it unacknowledged"
                );
                Err(sink_error)
            }
        }
    }

    async fn resolve(&self, record: &StreamRecord) {
        let id = DeadLetter::stream_id(record.partition, record.offset);
        match self.dead_letters.resolve(&id, Utc::now()).await {
            Ok(_) => info!(
                event_name = "dead_letter.resolved",
                dead_letter_id = %id,
                "parked event succeeded on retry"
            ),
            Err(sink_error) => warn!(
                event_name = "dead_letter.resolve_failed",
                dead_letter_id = %id,
                error = %sink_error,
                "could not mark dead letter resolved"
            ),
        }
    }

    fn stopped(&self) -> WorkerExit {
        info!(event_name = "consumer.partition.stopped", partition = self.partition, "partition stopped on shutdown");
        WorkerExit::ShutDown
    }
}

/// Resolves once shutdown is signalled. A dropped sender never signals.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
